use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use thiserror::Error;

use crate::{data_types::ChannelId, sockets::connection::Connection};

#[derive(Debug, PartialEq, Error)]
pub enum RegistryError {
    #[error("channel {channel_id} is already registered")]
    Duplicate { channel_id: ChannelId },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// The single owner of every live connection, keyed by channel id. Other components keep
/// only channel ids; a looked up connection is held just for the call it is needed for.
///
/// The lock is held for the map operation only, never while calling into a connection,
/// so a connection's own lock is never taken while this one is held.
#[derive(Default)]
pub struct ChannelRegistry {
    connections: RwLock<HashMap<ChannelId, Arc<Connection>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails without replacing anything when the channel id is already taken
    pub fn insert(self: &Self, connection: Arc<Connection>) -> RegistryResult<()> {
        let channel_id = connection.channel_id();
        let mut connections = self.write();
        if connections.contains_key(&channel_id) {
            return Err(RegistryError::Duplicate { channel_id });
        }
        connections.insert(channel_id, connection);
        Ok(())
    }

    pub fn get(self: &Self, channel_id: ChannelId) -> Option<Arc<Connection>> {
        self.read().get(&channel_id).cloned()
    }

    pub fn remove(self: &Self, channel_id: ChannelId) -> Option<Arc<Connection>> {
        self.write().remove(&channel_id)
    }

    pub fn contains(self: &Self, channel_id: ChannelId) -> bool {
        self.read().contains_key(&channel_id)
    }

    pub fn len(self: &Self) -> usize {
        self.read().len()
    }

    pub fn is_empty(self: &Self) -> bool {
        self.len() == 0
    }

    /// A point in time copy of the registered connections
    pub fn connections(self: &Self) -> Vec<Arc<Connection>> {
        self.read().values().cloned().collect()
    }

    pub fn channel_ids(self: &Self) -> Vec<ChannelId> {
        let mut channel_ids: Vec<ChannelId> = self.read().keys().copied().collect();
        channel_ids.sort_unstable();
        channel_ids
    }

    /// Removes every entry whose connection matches `predicate` and hands them back, so
    /// that the caller destroys them after the registry lock is released
    pub fn remove_where(self: &Self, predicate: impl Fn(&Connection) -> bool) -> Vec<Arc<Connection>> {
        // Connection locks are taken on a snapshot, with no registry lock held
        let mut matching: Vec<ChannelId> = Vec::new();
        for connection in self.connections() {
            if predicate(connection.as_ref()) {
                matching.push(connection.channel_id());
            }
        }

        let mut connections = self.write();
        matching
            .into_iter()
            .filter_map(|channel_id| connections.remove(&channel_id))
            .collect()
    }

    fn read(self: &Self) -> RwLockReadGuard<'_, HashMap<ChannelId, Arc<Connection>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(self: &Self) -> RwLockWriteGuard<'_, HashMap<ChannelId, Arc<Connection>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }
}
