//! Client registry
//!
//! Shared map of nickname → registered client, plus per-address connection
//! counts used for admission control. Every access goes through one
//! reader/writer lock so lookups and mutations see a consistent snapshot.
//!
//! Slot reservations and nickname registrations are handed out as guard
//! values. Dropping a guard performs the matching release, so each one
//! happens exactly once per connection.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::client::Client;
use crate::error::ChatError;
use crate::types::{random_suffix, ClientId, Nickname};

#[derive(Debug, Default)]
struct RegistryState {
    clients: HashMap<String, Client>,
    slots: HashMap<IpAddr, usize>,
}

/// Cloneable handle to the shared registry
#[derive(Debug, Clone, Default)]
pub struct Registry {
    state: Arc<RwLock<RegistryState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a connection slot for `addr` if it is below `max_per_addr`
    ///
    /// Returns `None` when the address is already at its limit.
    pub fn try_reserve_slot(&self, addr: IpAddr, max_per_addr: usize) -> Option<SlotReservation> {
        let mut state = self.write();
        let count = state.slots.entry(addr).or_insert(0);
        if *count >= max_per_addr {
            debug!(%addr, count = *count, "connection slot refused");
            if *count == 0 {
                state.slots.remove(&addr);
            }
            return None;
        }
        *count += 1;

        Some(SlotReservation {
            registry: self.clone(),
            addr,
        })
    }

    /// Release one slot for `addr`; the count never goes below zero
    pub fn release_slot(&self, addr: IpAddr) {
        let mut state = self.write();
        match state.slots.get_mut(&addr) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.slots.remove(&addr);
            }
            None => {
                if cfg!(debug_assertions) {
                    warn!(%addr, "slot released without a reservation");
                }
            }
        }
    }

    /// Active connection count for `addr`
    pub fn connections_from(&self, addr: IpAddr) -> usize {
        self.read().slots.get(&addr).copied().unwrap_or(0)
    }

    /// Insert a client under `requested`, or under a suffixed variant if taken
    ///
    /// The uniqueness check and the insert happen under one write lock. If the
    /// suffixed nickname collides too, fails with `NickExhausted`.
    pub fn register_unique<F>(
        &self,
        requested: &Nickname,
        make_client: F,
    ) -> Result<Registration, ChatError>
    where
        F: FnOnce(String) -> Client,
    {
        self.register_unique_with(requested, random_suffix, make_client)
    }

    pub(crate) fn register_unique_with<S, F>(
        &self,
        requested: &Nickname,
        suffix: S,
        make_client: F,
    ) -> Result<Registration, ChatError>
    where
        S: FnOnce() -> String,
        F: FnOnce(String) -> Client,
    {
        let mut state = self.write();

        let nick = if state.clients.contains_key(requested.as_str()) {
            let candidate = format!("{}{}", requested, suffix());
            if state.clients.contains_key(&candidate) {
                return Err(ChatError::NickExhausted(requested.to_string()));
            }
            candidate
        } else {
            requested.to_string()
        };

        let client = make_client(nick.clone());
        let id = client.id;
        state.clients.insert(nick.clone(), client);

        Ok(Registration {
            registry: self.clone(),
            nick,
            id,
        })
    }

    pub fn lookup(&self, nick: &str) -> Option<Client> {
        self.read().clients.get(nick).cloned()
    }

    pub fn contains(&self, nick: &str) -> bool {
        self.read().clients.contains_key(nick)
    }

    pub fn remove(&self, nick: &str) -> Option<Client> {
        self.write().clients.remove(nick)
    }

    /// Remove `nick` only if it still belongs to connection `id`
    fn remove_owned(&self, nick: &str, id: ClientId) -> Option<Client> {
        let mut state = self.write();
        match state.clients.get(nick) {
            Some(client) if client.id == id => state.clients.remove(nick),
            _ => None,
        }
    }

    /// Number of registered clients
    pub fn len(&self) -> usize {
        self.read().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().clients.is_empty()
    }

    /// Copy of every registered client, taken under the read lock
    pub fn snapshot(&self) -> Vec<Client> {
        self.read().clients.values().cloned().collect()
    }
}

/// A reserved per-address connection slot, released on drop
#[derive(Debug)]
pub struct SlotReservation {
    registry: Registry,
    addr: IpAddr,
}

impl SlotReservation {
    pub fn addr(&self) -> IpAddr {
        self.addr
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.registry.release_slot(self.addr);
    }
}

/// A registered nickname, removed from the registry on drop
#[derive(Debug)]
pub struct Registration {
    registry: Registry,
    nick: String,
    id: ClientId,
}

impl Registration {
    pub fn nick(&self) -> &str {
        &self.nick
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.remove_owned(&self.nick, self.id).is_some() {
            debug!(nick = %self.nick, "client unregistered");
        }
    }
}
