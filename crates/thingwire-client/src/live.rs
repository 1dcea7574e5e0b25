//! Decides which local handler answers an inbound live command.
//!
//! Handles for things and features are owned outside the dispatcher and
//! reached through lookup hooks. A handle either can process live commands
//! or it cannot; a processor returns whether it handled the command.
//! Resolution order is feature, then thing, then the global table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use thingwire_core::{CommandAction, ThingId};
use tracing::{debug, warn};

use crate::signal::LiveCommand;

pub type LiveProcessor = Arc<dyn Fn(&LiveCommand) -> bool + Send + Sync>;
pub type FeatureHandleLookup = Arc<dyn Fn(&ThingId, &str) -> Option<Handle> + Send + Sync>;
pub type EntityHandleLookup = Arc<dyn Fn(&ThingId) -> Option<Handle> + Send + Sync>;

#[derive(Clone)]
pub enum Handle {
    /// Exists locally but does not take live commands.
    Plain,
    LiveCapable(LiveProcessor),
}

impl Handle {
    pub fn live<F>(processor: F) -> Self
    where
        F: Fn(&LiveCommand) -> bool + Send + Sync + 'static,
    {
        Self::LiveCapable(Arc::new(processor))
    }

    fn process(&self, command: &LiveCommand) -> bool {
        match self {
            Self::Plain => false,
            Self::LiveCapable(processor) => processor(command),
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => f.write_str("Plain"),
            Self::LiveCapable(_) => f.write_str("LiveCapable"),
        }
    }
}

/// Fallback processors by command action, tried in registration order.
#[derive(Clone, Default)]
pub struct GlobalHandlers {
    by_action: HashMap<CommandAction, Vec<LiveProcessor>>,
    any: Vec<LiveProcessor>,
}

impl GlobalHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, action: CommandAction, processor: F) -> Self
    where
        F: Fn(&LiveCommand) -> bool + Send + Sync + 'static,
    {
        self.by_action.entry(action).or_default().push(Arc::new(processor));
        self
    }

    /// Tried after the action-specific processors, for every action.
    pub fn on_any<F>(mut self, processor: F) -> Self
    where
        F: Fn(&LiveCommand) -> bool + Send + Sync + 'static,
    {
        self.any.push(Arc::new(processor));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.by_action.is_empty() && self.any.is_empty()
    }

    fn process(&self, command: &LiveCommand) -> bool {
        let action = command.frame().topic().command_action();
        let specific = action
            .and_then(|action| self.by_action.get(&action))
            .into_iter()
            .flatten();
        specific.chain(self.any.iter()).any(|processor| processor(command))
    }
}

/// Which handler took a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Feature,
    Entity,
    Global,
    Unhandled,
}

#[derive(Default)]
pub struct LiveCommandDispatcher {
    features: RwLock<Option<FeatureHandleLookup>>,
    entities: RwLock<Option<EntityHandleLookup>>,
    globals: RwLock<GlobalHandlers>,
}

impl LiveCommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_feature_handle_lookup(&self, lookup: FeatureHandleLookup) {
        *self.features.write() = Some(lookup);
    }

    pub fn set_entity_handle_lookup(&self, lookup: EntityHandleLookup) {
        *self.entities.write() = Some(lookup);
    }

    pub fn set_global_handlers(&self, handlers: GlobalHandlers) {
        *self.globals.write() = handlers;
    }

    pub fn dispatch(&self, command: &LiveCommand) -> Dispatch {
        let frame = command.frame();
        let Some(thing) = frame.thing_id() else {
            warn!(topic = %frame.topic(), "live command without a thing");
            return Dispatch::Unhandled;
        };

        if let Some(feature) = frame.feature_id() {
            let lookup = self.features.read().clone();
            if let Some(handle) = lookup.and_then(|lookup| lookup(&thing, feature)) {
                if handle.process(command) {
                    debug!(thing = %thing, feature, "live command handled by feature");
                    return Dispatch::Feature;
                }
            }
        }

        let lookup = self.entities.read().clone();
        if let Some(handle) = lookup.and_then(|lookup| lookup(&thing)) {
            if handle.process(command) {
                debug!(thing = %thing, "live command handled by thing");
                return Dispatch::Entity;
            }
        }

        let globals = self.globals.read().clone();
        if globals.process(command) {
            debug!(thing = %thing, "live command handled globally");
            return Dispatch::Global;
        }

        warn!(
            topic = %frame.topic(),
            path = frame.path(),
            correlation_id = ?frame.correlation_id(),
            "unhandled live command"
        );
        Dispatch::Unhandled
    }
}

/// Per-thing and per-feature live handles registered through the client.
#[derive(Default)]
pub struct LiveHandles {
    things: DashMap<ThingId, Handle>,
    features: DashMap<(ThingId, String), Handle>,
}

impl LiveHandles {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_thing(&self, thing: ThingId, handle: Handle) {
        let _ = self.things.insert(thing, handle);
    }

    pub fn set_feature(&self, thing: ThingId, feature: impl Into<String>, handle: Handle) {
        let _ = self.features.insert((thing, feature.into()), handle);
    }

    pub fn remove_thing(&self, thing: &ThingId) -> bool {
        self.things.remove(thing).is_some()
    }

    pub fn remove_feature(&self, thing: &ThingId, feature: &str) -> bool {
        self.features.remove(&(thing.clone(), feature.to_owned())).is_some()
    }

    pub fn entity_lookup(self: &Arc<Self>) -> EntityHandleLookup {
        let handles = Arc::clone(self);
        Arc::new(move |thing: &ThingId| handles.things.get(thing).map(|h| h.value().clone()))
    }

    pub fn feature_lookup(self: &Arc<Self>) -> FeatureHandleLookup {
        let handles = Arc::clone(self);
        Arc::new(move |thing: &ThingId, feature: &str| {
            handles
                .features
                .get(&(thing.clone(), feature.to_owned()))
                .map(|h| h.value().clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thingwire_transport::FrameSink;

    fn command(path: &str, action: &str) -> LiveCommand {
        let json = format!(
            r#"{{"topic":"org.acme/lamp/things/live/commands/{action}","headers":{{"correlation-id":"c"}},"path":"{path}"}}"#
        );
        let sink: Arc<dyn FrameSink> = Arc::new(RecordingSink::default());
        LiveCommand::new(serde_json::from_str(&json).unwrap(), sink)
    }

    fn counting(result: bool) -> (Handle, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = Handle::live(move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            result
        });
        (handle, calls)
    }

    fn dispatcher_with(feature: Option<Handle>, entity: Option<Handle>, globals: GlobalHandlers) -> LiveCommandDispatcher {
        let dispatcher = LiveCommandDispatcher::new();
        dispatcher.set_feature_handle_lookup(Arc::new(move |_: &ThingId, _: &str| feature.clone()));
        dispatcher.set_entity_handle_lookup(Arc::new(move |_: &ThingId| entity.clone()));
        dispatcher.set_global_handlers(globals);
        dispatcher
    }

    #[test]
    fn feature_handler_beats_entity_and_global() {
        let (feature, feature_calls) = counting(true);
        let (entity, entity_calls) = counting(true);
        let global_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&global_calls);
        let globals = GlobalHandlers::new().on_any(move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        let dispatcher = dispatcher_with(Some(feature), Some(entity), globals);

        let outcome = dispatcher.dispatch(&command("/features/light/properties/on", "modify"));
        assert_eq!(outcome, Dispatch::Feature);
        assert_eq!(feature_calls.load(Ordering::SeqCst), 1);
        assert_eq!(entity_calls.load(Ordering::SeqCst), 0);
        assert_eq!(global_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn declining_feature_falls_through_to_entity() {
        let (feature, feature_calls) = counting(false);
        let (entity, _) = counting(true);
        let dispatcher = dispatcher_with(Some(feature), Some(entity), GlobalHandlers::new());

        assert_eq!(
            dispatcher.dispatch(&command("/features/light", "modify")),
            Dispatch::Entity
        );
        assert_eq!(feature_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn plain_handles_are_skipped() {
        let globals = GlobalHandlers::new().on(CommandAction::Delete, |_| true);
        let dispatcher = dispatcher_with(Some(Handle::Plain), Some(Handle::Plain), globals);
        assert_eq!(dispatcher.dispatch(&command("/features/light", "delete")), Dispatch::Global);
    }

    #[test]
    fn feature_lookup_not_consulted_for_thing_paths() {
        let (feature, feature_calls) = counting(true);
        let (entity, _) = counting(true);
        let dispatcher = dispatcher_with(Some(feature), Some(entity), GlobalHandlers::new());
        assert_eq!(dispatcher.dispatch(&command("/attributes/room", "modify")), Dispatch::Entity);
        assert_eq!(feature_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn global_handlers_match_action_in_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (first, second, fallback) = (Arc::clone(&order), Arc::clone(&order), Arc::clone(&order));
        let globals = GlobalHandlers::new()
            .on(CommandAction::Create, move |_| {
                first.lock().push("create-1");
                false
            })
            .on(CommandAction::Create, move |_| {
                second.lock().push("create-2");
                true
            })
            .on_any(move |_| {
                fallback.lock().push("any");
                true
            });
        let dispatcher = dispatcher_with(None, None, globals);

        assert_eq!(dispatcher.dispatch(&command("/", "create")), Dispatch::Global);
        assert_eq!(*order.lock(), vec!["create-1", "create-2"]);

        order.lock().clear();
        assert_eq!(dispatcher.dispatch(&command("/", "merge")), Dispatch::Global);
        assert_eq!(*order.lock(), vec!["any"]);
    }

    #[test]
    fn nothing_registered_is_unhandled() {
        let dispatcher = LiveCommandDispatcher::new();
        assert_eq!(dispatcher.dispatch(&command("/", "modify")), Dispatch::Unhandled);
    }

    #[test]
    fn live_handles_back_the_lookups() {
        let handles = LiveHandles::new();
        let thing = ThingId::new("org.acme", "lamp");
        let (feature, calls) = counting(true);
        handles.set_feature(thing.clone(), "light", feature);

        let dispatcher = LiveCommandDispatcher::new();
        dispatcher.set_feature_handle_lookup(handles.feature_lookup());
        dispatcher.set_entity_handle_lookup(handles.entity_lookup());

        assert_eq!(dispatcher.dispatch(&command("/features/light", "modify")), Dispatch::Feature);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handles.remove_feature(&thing, "light"));
        assert_eq!(dispatcher.dispatch(&command("/features/light", "modify")), Dispatch::Unhandled);
    }
}
