//! Connection Table
//!
//! Maps reactor tokens to live connections. Slots are reused, so each token
//! also carries a generation: an event or completion for a connection that
//! has since been replaced in the same slot no longer resolves.
//!
//! ```text
//!  Token bits:  [ generation (high half) | slab index (low half) ]
//! ```

use crate::connection::Connection;
use mio::Token;
use slab::Slab;
use std::sync::Arc;

const INDEX_BITS: u32 = usize::BITS / 2;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;

/// Reserved for the reactor waker. No connection token ever equals it
/// because generations never reach the all-ones value.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

struct Slot {
    generation: usize,
    connection: Arc<Connection>,
}

/// Registered connections of one worker.
#[derive(Default)]
pub struct ConnectionTable {
    slots: Slab<Slot>,
    next_generation: usize,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a slot for `connection` and returns its token.
    ///
    /// Returns `None` if the slab index no longer fits the token layout.
    pub fn insert(&mut self, connection: Arc<Connection>) -> Option<Token> {
        let entry = self.slots.vacant_entry();
        let index = entry.key();
        if index > INDEX_MASK {
            return None;
        }

        let generation = self.next_generation;
        self.next_generation = (self.next_generation + 1) % INDEX_MASK;
        entry.insert(Slot {
            generation,
            connection,
        });

        Some(Token((generation << INDEX_BITS) | index))
    }

    /// Returns the connection registered under `token`, unless it is stale.
    pub fn get(&self, token: Token) -> Option<Arc<Connection>> {
        let (index, generation) = split(token);
        self.slots
            .get(index)
            .filter(|slot| slot.generation == generation)
            .map(|slot| Arc::clone(&slot.connection))
    }

    /// Removes and returns the connection registered under `token`.
    pub fn remove(&mut self, token: Token) -> Option<Arc<Connection>> {
        let (index, generation) = split(token);
        match self.slots.get(index) {
            Some(slot) if slot.generation == generation => {
                Some(self.slots.remove(index).connection)
            }
            _ => None,
        }
    }

    /// Removes every connection.
    pub fn drain(&mut self) -> Vec<Arc<Connection>> {
        self.slots.drain().map(|slot| slot.connection).collect()
    }

    /// Snapshot of every registered connection with its token.
    pub fn entries(&self) -> Vec<(Token, Arc<Connection>)> {
        self.slots
            .iter()
            .map(|(index, slot)| {
                let token = Token((slot.generation << INDEX_BITS) | index);
                (token, Arc::clone(&slot.connection))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn split(token: Token) -> (usize, usize) {
    (token.0 & INDEX_MASK, token.0 >> INDEX_BITS)
}
