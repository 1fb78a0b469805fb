//! In-memory ledger of declared topology, replayed during recovery.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::handler::DeliveryHandler;
use crate::transport::{ConsumeOptions, ExchangeKind, ExchangeOptions, QueueOptions};

/// Caller-visible channel identifier, stable across recovery.
pub type ChannelId = u16;

/// Identity of a registry entry within one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Queue(String),
    Exchange(String),
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Consumer(String),
    Qos,
}

/// One recorded declaration.
#[derive(Clone)]
pub enum Entry {
    /// `name` is the effective name, broker-generated ones included.
    Queue { name: String, options: QueueOptions },
    Exchange {
        name: String,
        kind: ExchangeKind,
        options: ExchangeOptions,
    },
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    /// `options.consumer_tag` holds the effective tag.
    Consumer {
        queue: String,
        options: ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    },
    Qos { prefetch_count: u16, global: bool },
}

impl Entry {
    pub fn key(&self) -> EntryKey {
        match self {
            Entry::Queue { name, .. } => EntryKey::Queue(name.clone()),
            Entry::Exchange { name, .. } => EntryKey::Exchange(name.clone()),
            Entry::Binding {
                queue,
                exchange,
                routing_key,
            } => EntryKey::Binding {
                queue: queue.clone(),
                exchange: exchange.clone(),
                routing_key: routing_key.clone(),
            },
            Entry::Consumer { options, .. } => EntryKey::Consumer(options.consumer_tag.clone()),
            Entry::Qos { .. } => EntryKey::Qos,
        }
    }

    /// Declarations keep their first position when repeated; consumers and
    /// QoS settings are superseded by a newer entry.
    fn superseded_by_repeat(&self) -> bool {
        matches!(self, Entry::Consumer { .. } | Entry::Qos { .. })
    }

    fn references_queue(&self, queue: &str) -> bool {
        match self {
            Entry::Queue { name, .. } => name == queue,
            Entry::Binding { queue: q, .. } | Entry::Consumer { queue: q, .. } => q == queue,
            _ => false,
        }
    }

    fn references_exchange(&self, exchange: &str) -> bool {
        match self {
            Entry::Exchange { name, .. } => name == exchange,
            Entry::Binding { exchange: x, .. } => x == exchange,
            _ => false,
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Queue { name, options } => f
                .debug_struct("Queue")
                .field("name", name)
                .field("options", options)
                .finish(),
            Entry::Exchange {
                name,
                kind,
                options,
            } => f
                .debug_struct("Exchange")
                .field("name", name)
                .field("kind", kind)
                .field("options", options)
                .finish(),
            Entry::Binding {
                queue,
                exchange,
                routing_key,
            } => f
                .debug_struct("Binding")
                .field("queue", queue)
                .field("exchange", exchange)
                .field("routing_key", routing_key)
                .finish(),
            Entry::Consumer { queue, options, .. } => f
                .debug_struct("Consumer")
                .field("queue", queue)
                .field("options", options)
                .finish_non_exhaustive(),
            Entry::Qos {
                prefetch_count,
                global,
            } => f
                .debug_struct("Qos")
                .field("prefetch_count", prefetch_count)
                .field("global", global)
                .finish(),
        }
    }
}

/// Per-channel ordered record of declarations.
///
/// Insertion order is replay order: an exchange recorded before a binding is
/// redeclared before that binding.
#[derive(Default, Debug)]
pub struct TopologyRegistry {
    channels: HashMap<ChannelId, Vec<Entry>>,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `entry` for `channel`.
    pub fn record(&mut self, channel: ChannelId, entry: Entry) {
        let entries = self.channels.entry(channel).or_default();
        let key = entry.key();
        if let Some(pos) = entries.iter().position(|e| e.key() == key) {
            if !entry.superseded_by_repeat() {
                return;
            }
            entries.remove(pos);
        }
        entries.push(entry);
    }

    /// Entries for `channel` in insertion order.
    pub fn entries_for(&self, channel: ChannelId) -> Vec<Entry> {
        self.channels.get(&channel).cloned().unwrap_or_default()
    }

    pub fn remove(&mut self, channel: ChannelId, key: &EntryKey) -> Option<Entry> {
        let entries = self.channels.get_mut(&channel)?;
        let pos = entries.iter().position(|e| &e.key() == key)?;
        Some(entries.remove(pos))
    }

    /// Remove `key` from whichever channels recorded it.
    pub fn remove_everywhere(&mut self, key: &EntryKey) -> usize {
        let mut removed = 0;
        for entries in self.channels.values_mut() {
            let before = entries.len();
            entries.retain(|e| &e.key() != key);
            removed += before - entries.len();
        }
        removed
    }

    /// Drop everything recorded for `channel`.
    pub fn remove_channel(&mut self, channel: ChannelId) -> Vec<Entry> {
        self.channels.remove(&channel).unwrap_or_default()
    }

    /// Drop a deleted queue with its bindings and consumers, on every channel.
    pub fn remove_queue(&mut self, queue: &str) {
        for entries in self.channels.values_mut() {
            entries.retain(|e| !e.references_queue(queue));
        }
    }

    /// Drop a deleted exchange with its bindings, on every channel.
    pub fn remove_exchange(&mut self, exchange: &str) {
        for entries in self.channels.values_mut() {
            entries.retain(|e| !e.references_exchange(exchange));
        }
    }

    /// Whether `queue` was declared auto-delete and has no recorded consumer left.
    pub fn is_abandoned_auto_delete(&self, queue: &str) -> bool {
        let mut auto_delete = false;
        for entry in self.channels.values().flatten() {
            match entry {
                Entry::Queue { name, options } if name == queue => {
                    auto_delete |= options.auto_delete
                }
                Entry::Consumer { queue: q, .. } if q == queue => return false,
                _ => {}
            }
        }
        auto_delete
    }

    /// Channels with at least one entry, ascending.
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| *k)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}
