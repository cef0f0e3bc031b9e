use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use crate::agent::Consumer;
use crate::channel::{Channel, ChannelSet, PushListener};
use crate::message::Message;

/// Routes pushed messages to the subscribed consumers.
///
/// The dispatcher keeps a registry of subscribed consumers by client id and
/// listens for pushes on every channel set at least one of them uses. It
/// stops listening on a channel set the moment its last consumer goes away.
///
/// Several channel sets may sit on the same physical channel, in which case
/// one message from the server arrives once per listened set. The first
/// sighting is delivered; the dispatcher then records how many more copies
/// to expect for that consumer and drops them as they arrive.
pub struct ConsumerMessageDispatcher {
    state: Mutex<DispatcherState>,
    self_ref: Weak<ConsumerMessageDispatcher>,
}

struct Registration {
    client_id: String,
    channel_set: Arc<ChannelSet>,
    /// Channel whose polling this registration turned on.
    channel: Option<Arc<Channel>>,
}

#[derive(Default)]
struct DispatcherState {
    /// Subscribed consumers by client id.
    consumers: HashMap<String, Weak<Consumer>>,
    /// Registration of each consumer, by agent id.
    registrations: HashMap<String, Registration>,
    /// Listened channel sets and how many consumers use each.
    channel_sets: HashMap<String, (Weak<ChannelSet>, usize)>,
    /// Copies still expected per consumer id and message id.
    duplicate_barriers: HashMap<String, HashMap<String, usize>>,
}

impl ConsumerMessageDispatcher {
    /// Creates a dispatcher with empty registries.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            state: Mutex::new(DispatcherState::default()),
            self_ref: self_ref.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, DispatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn as_listener(&self) -> Weak<dyn PushListener> {
        self.self_ref.clone()
    }

    /// Registers a subscribed consumer under its client id.
    ///
    /// The first consumer on a channel set starts the push listening, and
    /// every registration turns on polling for channels that poll.
    pub fn register(&self, consumer: &Arc<Consumer>) {
        let (Some(client_id), Some(channel_set)) = (consumer.client_id(), consumer.channel_set())
        else {
            debug!(agent = %consumer.agent().id(), "consumer without client id or channel set not registered");
            return;
        };
        let consumer_id = consumer.agent().id().to_string();
        let channel = channel_set.current_channel();
        let listen = {
            let mut state = self.state();
            if state.registrations.contains_key(&consumer_id) {
                return;
            }
            state
                .consumers
                .insert(client_id.clone(), Arc::downgrade(consumer));
            state.registrations.insert(
                consumer_id.clone(),
                Registration {
                    client_id: client_id.clone(),
                    channel_set: Arc::clone(&channel_set),
                    channel: channel.clone(),
                },
            );
            let entry = state
                .channel_sets
                .entry(channel_set.id().to_string())
                .or_insert_with(|| (Arc::downgrade(&channel_set), 0));
            entry.1 += 1;
            entry.1 == 1
        };
        if listen {
            debug!(channel_set = %channel_set.id(), "listening for pushes");
            channel_set.add_push_listener(self.as_listener());
        }
        if let Some(channel) = channel {
            channel.enable_polling();
        }
        info!(agent = %consumer_id, %client_id, "consumer registered");
    }

    /// Removes a consumer along with any duplicates still expected for it.
    pub fn unregister(&self, consumer: &Consumer) {
        let consumer_id = consumer.agent().id();
        let (registration, unlisten) = {
            let mut state = self.state();
            let Some(registration) = state.registrations.remove(consumer_id) else {
                return;
            };
            let owned = state
                .consumers
                .get(&registration.client_id)
                .and_then(Weak::upgrade)
                .is_none_or(|c| c.agent().id() == consumer_id);
            if owned {
                state.consumers.remove(&registration.client_id);
            }
            state.duplicate_barriers.remove(consumer_id);
            let set_id = registration.channel_set.id().to_string();
            let unlisten = match state.channel_sets.get_mut(&set_id) {
                Some(entry) if entry.1 > 1 => {
                    entry.1 -= 1;
                    false
                }
                Some(_) => {
                    state.channel_sets.remove(&set_id);
                    true
                }
                None => false,
            };
            (registration, unlisten)
        };
        if unlisten {
            debug!(channel_set = %registration.channel_set.id(), "no consumers left, stop listening");
            registration
                .channel_set
                .remove_push_listener(&self.as_listener());
        }
        if let Some(channel) = &registration.channel {
            channel.disable_polling();
        }
        info!(agent = %consumer_id, client_id = %registration.client_id, "consumer unregistered");
    }

    /// Whether any registered consumer receives through `channel`.
    pub fn is_channel_used_for_subscriptions(&self, channel: &Channel) -> bool {
        let sets: Vec<_> = self
            .state()
            .channel_sets
            .values()
            .filter_map(|(set, _)| set.upgrade())
            .collect();
        sets.iter().any(|set| {
            set.current_channel()
                .is_some_and(|current| current.id() == channel.id())
        })
    }

    /// Number of registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.state().registrations.len()
    }

    /// Copies of `message_id` still expected for the consumer with agent id
    /// `consumer_id`.
    pub(crate) fn expected_duplicates(&self, consumer_id: &str, message_id: &str) -> Option<usize> {
        self.state()
            .duplicate_barriers
            .get(consumer_id)
            .and_then(|barrier| barrier.get(message_id))
            .copied()
    }

    fn listened_sets(&self) -> Vec<Arc<ChannelSet>> {
        self.state()
            .channel_sets
            .values()
            .filter_map(|(set, _)| set.upgrade())
            .collect()
    }
}

impl PushListener for ConsumerMessageDispatcher {
    fn on_push(&self, channel_set: &Arc<ChannelSet>, message: Message) {
        let Some(client_id) = message.client_id.clone() else {
            debug!(channel_set = %channel_set.id(), "push without client id dropped");
            return;
        };
        let consumer = self.state().consumers.get(&client_id).and_then(Weak::upgrade);
        let Some(consumer) = consumer else {
            debug!(%client_id, "push for unknown consumer dropped");
            return;
        };
        let consumer_id = consumer.agent().id().to_string();
        let message_id = message.message_id().to_string();

        {
            let mut state = self.state();
            if let Some(barrier) = state.duplicate_barriers.get_mut(&consumer_id) {
                if let Some(remaining) = barrier.get_mut(&message_id) {
                    *remaining -= 1;
                    if *remaining == 0 {
                        barrier.remove(&message_id);
                    }
                    if barrier.is_empty() {
                        state.duplicate_barriers.remove(&consumer_id);
                    }
                    debug!(agent = %consumer_id, %message_id, "duplicate push dropped");
                    return;
                }
            }
        }

        // Copies are counted once, from the sets listened to right now.
        let shared = channel_set.current_channel().map_or(1, |channel| {
            self.listened_sets()
                .iter()
                .filter(|set| {
                    set.current_channel()
                        .is_some_and(|current| current.id() == channel.id())
                })
                .count()
        });
        if shared > 1 {
            debug!(agent = %consumer_id, %message_id, copies = shared, "expecting duplicate pushes");
            self.state()
                .duplicate_barriers
                .entry(consumer_id)
                .or_default()
                .insert(message_id, shared - 1);
        }
        consumer.deliver(message);
    }
}
