//! Connected channel registry
//!
//! Holds the channels the user has connected, in connection order. The
//! collection may also contain an "all channels" marker used by the user
//! interface to apply an action to every channel; it is never read from.
//!
//! The registry is mutated by user actions while the polling worker iterates
//! it, so every access goes through one structural lock. Readers take copies
//! and release the lock before talking to the driver.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::types::ChannelHandle;

/// A connected channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDescriptor {
    /// Driver handle of the channel
    pub handle: ChannelHandle,
    /// Whether the channel is read while polling
    pub active: bool,
    /// Whether the channel was opened in FD mode
    pub is_fd: bool,
}

impl ChannelDescriptor {
    /// An active classic channel
    pub fn classic(handle: ChannelHandle) -> Self {
        Self {
            handle,
            active: true,
            is_fd: false,
        }
    }

    /// An active FD channel
    pub fn fd(handle: ChannelHandle) -> Self {
        Self {
            handle,
            active: true,
            is_fd: true,
        }
    }

    /// Builder method: set the active flag
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// One entry of the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEntry {
    /// "Apply to all channels" marker
    AllChannels,
    /// A real connected channel
    Channel(ChannelDescriptor),
}

impl RegistryEntry {
    /// The channel descriptor, or None for the marker
    pub fn channel(&self) -> Option<&ChannelDescriptor> {
        match self {
            RegistryEntry::AllChannels => None,
            RegistryEntry::Channel(descriptor) => Some(descriptor),
        }
    }
}

/// Ordered, lock-protected collection of connected channels
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    entries: Mutex<Vec<RegistryEntry>>,
}

impl ChannelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a channel, replacing in place any descriptor with the same handle
    ///
    /// # Returns
    /// * `true` if the channel is new, `false` if an existing entry was replaced
    pub fn add(&self, descriptor: ChannelDescriptor) -> bool {
        let mut entries = self.lock();
        let existing = entries.iter_mut().find(|entry| {
            matches!(entry, RegistryEntry::Channel(current) if current.handle == descriptor.handle)
        });

        match existing {
            Some(entry) => {
                *entry = RegistryEntry::Channel(descriptor);
                log::debug!("Channel {} updated in registry", descriptor.handle);
                false
            }
            None => {
                entries.push(RegistryEntry::Channel(descriptor));
                log::debug!("Channel {} added to registry", descriptor.handle);
                true
            }
        }
    }

    /// Append the "all channels" marker unless it is already present
    pub fn add_all_channels_marker(&self) {
        let mut entries = self.lock();
        if !entries.contains(&RegistryEntry::AllChannels) {
            entries.push(RegistryEntry::AllChannels);
        }
    }

    /// Remove a channel
    ///
    /// # Returns
    /// * The removed descriptor, or None if the handle was not registered
    pub fn remove(&self, handle: ChannelHandle) -> Option<ChannelDescriptor> {
        let mut entries = self.lock();
        let position = entries
            .iter()
            .position(|entry| entry.channel().map(|c| c.handle) == Some(handle))?;

        let removed = entries.remove(position);
        log::debug!("Channel {} removed from registry", handle);
        removed.channel().copied()
    }

    /// Set the active flag of one channel
    ///
    /// # Returns
    /// * `false` if the handle is not registered
    pub fn set_active(&self, handle: ChannelHandle, active: bool) -> bool {
        let mut entries = self.lock();
        for entry in entries.iter_mut() {
            if let RegistryEntry::Channel(descriptor) = entry {
                if descriptor.handle == handle {
                    descriptor.active = active;
                    return true;
                }
            }
        }
        false
    }

    /// Set the active flag of every real channel
    pub fn set_all_active(&self, active: bool) {
        let mut entries = self.lock();
        for entry in entries.iter_mut() {
            if let RegistryEntry::Channel(descriptor) = entry {
                descriptor.active = active;
            }
        }
    }

    /// Look up a real channel by handle
    pub fn find(&self, handle: ChannelHandle) -> Option<ChannelDescriptor> {
        self.lock()
            .iter()
            .filter_map(RegistryEntry::channel)
            .find(|descriptor| descriptor.handle == handle)
            .copied()
    }

    /// Active real channels in registry order (the marker is skipped)
    pub fn active_channels(&self) -> Vec<ChannelDescriptor> {
        self.lock()
            .iter()
            .filter_map(RegistryEntry::channel)
            .filter(|descriptor| descriptor.active)
            .copied()
            .collect()
    }

    /// All real channels in registry order
    pub fn channels(&self) -> Vec<ChannelDescriptor> {
        self.lock().iter().filter_map(RegistryEntry::channel).copied().collect()
    }

    /// Copy of every entry, marker included
    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.lock().clone()
    }

    /// Number of entries, marker included
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
