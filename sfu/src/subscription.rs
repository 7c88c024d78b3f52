//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Per-participant subscription reconciliation: a desired-state map driven to
//! the actual publisher state by a single worker, with retry, timeout, and
//! cleanup policies.

use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Display, Formatter},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use relay_common::{Duration, Instant};
use log::*;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

/// The reconcile queue is a wakeup channel, not a work log; the periodic tick
/// covers anything dropped on overflow.
const RECONCILE_QUEUE_CAPACITY: usize = 10;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
        pub struct $name(String);

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(TrackId);
string_id!(ParticipantId);
string_id!(ParticipantIdentity);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("no permission to subscribe to track")]
    NoTrackPermission,
    #[error("participant is not allowed to subscribe")]
    NoSubscribePermission,
    #[error("track is not attached yet")]
    TrackNotAttached,
    #[error("publisher is not connected")]
    PublisherNotConnected,
    #[error("track not found")]
    TrackNotFound,
    #[error("already subscribed")]
    AlreadySubscribed,
    #[error("subscription failed: {0}")]
    Other(String),
}

/// Per-subscriber track settings carried from signaling.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriberSettings {
    pub muted: bool,
    pub max_height: Option<u32>,
    pub priority: Option<u32>,
}

/// What the resolver hands back for a `(publisher, track)` lookup.
pub struct TrackResolution {
    pub track: Arc<dyn MediaTrack>,
    pub has_permission: bool,
}

/// Resolves a track against the current room state. Expected to return
/// promptly.
pub type TrackResolver = Box<
    dyn Fn(&ParticipantIdentity, &ParticipantId, &TrackId) -> Result<TrackResolution, SubscriptionError>
        + Send
        + Sync,
>;

/// A publisher's track, shared between all of its subscribers. Mutation of
/// the subscriber set must be linearizable. Implementations should return the
/// existing subscribed track when a subscriber is added twice, or
/// [`SubscriptionError::AlreadySubscribed`] if they cannot.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> TrackId;
    fn add_subscriber(
        &self,
        subscriber: &Arc<dyn Participant>,
    ) -> Result<Arc<dyn SubscribedTrack>, SubscriptionError>;
    fn remove_subscriber(&self, subscriber_id: &ParticipantId, will_be_resumed: bool);
    /// Observers are keyed by subscriber ID; registering again replaces the
    /// previous observer. This is the weak back-reference that breaks the
    /// publisher/subscriber ownership cycle.
    fn add_change_observer(&self, subscriber_id: ParticipantId, observer: Box<dyn Fn() + Send + Sync>);
    fn remove_change_observer(&self, subscriber_id: &ParticipantId);
}

/// The active binding of one subscriber to one publisher track.
pub trait SubscribedTrack: Send + Sync {
    /// Replaces the close callback; `None` clears it.
    fn on_close(&self, callback: Option<Box<dyn Fn(bool) + Send + Sync>>);
    fn add_on_bind(&self, callback: Box<dyn Fn() + Send + Sync>);
    fn needs_negotiation(&self) -> bool;
    fn media_track(&self) -> Arc<dyn MediaTrack>;
    fn publisher_id(&self) -> ParticipantId;
    fn publisher_identity(&self) -> ParticipantIdentity;
    fn update_subscriber_settings(&self, settings: &SubscriberSettings);
    /// Tears down the forwarder; `flush` pushes out anything queued. Callers
    /// pass `flush = false` when the subscription will be resumed.
    fn close_with_flush(&self, flush: bool);
}

/// The subscribing participant, as seen by its subscription manager.
pub trait Participant: Send + Sync {
    fn id(&self) -> ParticipantId;
    fn identity(&self) -> ParticipantIdentity;
    fn can_subscribe(&self) -> bool;
    fn is_closed(&self) -> bool;
    fn is_disconnected(&self) -> bool;
    fn negotiate(&self, force: bool);
    fn remove_track_from_subscriber(&self, track: Arc<dyn SubscribedTrack>) -> anyhow::Result<()>;
    fn subscription_permission_update(
        &self,
        publisher_id: &ParticipantId,
        track_id: &TrackId,
        has_permission: bool,
    );
}

pub trait Telemetry: Send + Sync {
    fn track_subscribe_requested(
        &self,
        participant_id: &ParticipantId,
        track_id: &TrackId,
        publisher_id: &ParticipantId,
        publisher_identity: &ParticipantIdentity,
    );
    fn track_subscribed(
        &self,
        participant_id: &ParticipantId,
        track_id: &TrackId,
        publisher_id: &ParticipantId,
        publisher_identity: &ParticipantIdentity,
    );
    fn track_unsubscribed(&self, participant_id: &ParticipantId, track_id: &TrackId);
}

struct SubscriptionState {
    desired: bool,
    bound: bool,
    has_permission: bool,
    publisher_id: ParticipantId,
    publisher_identity: ParticipantIdentity,
    settings: Option<SubscriberSettings>,
    subscribed_track: Option<Arc<dyn SubscribedTrack>>,
}

/// Desired and actual state for one `(subscriber, track)` pair.
pub struct TrackSubscription {
    track_id: TrackId,
    state: RwLock<SubscriptionState>,
    // Lock-free so the reconciler can read attempt state without taking the
    // subscription lock.
    num_attempts: AtomicU32,
    // Micros since the manager epoch; zero means no attempt yet.
    sub_started_at_micros: AtomicU64,
}

impl TrackSubscription {
    fn new(track_id: TrackId) -> Self {
        Self {
            track_id,
            state: RwLock::new(SubscriptionState {
                desired: false,
                bound: false,
                // Default allow; the resolver corrects this.
                has_permission: true,
                publisher_id: ParticipantId::default(),
                publisher_identity: ParticipantIdentity::default(),
                settings: None,
                subscribed_track: None,
            }),
            num_attempts: AtomicU32::new(0),
            sub_started_at_micros: AtomicU64::new(0),
        }
    }

    pub fn track_id(&self) -> &TrackId {
        &self.track_id
    }

    fn set_publisher(&self, identity: ParticipantIdentity, id: ParticipantId) {
        let mut state = self.state.write();
        state.publisher_id = id;
        state.publisher_identity = identity;
    }

    pub fn publisher_id(&self) -> ParticipantId {
        self.state.read().publisher_id.clone()
    }

    pub fn publisher_identity(&self) -> ParticipantIdentity {
        self.state.read().publisher_identity.clone()
    }

    fn set_desired(&self, desired: bool) -> bool {
        let mut state = self.state.write();
        if state.desired == desired {
            return false;
        }
        state.desired = desired;
        true
    }

    pub fn is_desired(&self) -> bool {
        self.state.read().desired
    }

    fn set_has_permission(&self, has_permission: bool) -> bool {
        let mut state = self.state.write();
        if state.has_permission == has_permission {
            return false;
        }
        state.has_permission = has_permission;
        true
    }

    fn set_subscribed_track(&self, track: Option<Arc<dyn SubscribedTrack>>) {
        let settings;
        {
            let mut state = self.state.write();
            state.subscribed_track = track.clone();
            state.bound = false;
            settings = state.settings.clone();
        }
        if let (Some(settings), Some(track)) = (settings, track) {
            track.update_subscriber_settings(&settings);
        }
    }

    pub fn subscribed_track(&self) -> Option<Arc<dyn SubscribedTrack>> {
        self.state.read().subscribed_track.clone()
    }

    fn set_settings(&self, settings: SubscriberSettings) {
        let subscribed_track;
        {
            let mut state = self.state.write();
            state.settings = Some(settings.clone());
            subscribed_track = state.subscribed_track.clone();
        }
        if let Some(track) = subscribed_track {
            track.update_subscriber_settings(&settings);
        }
    }

    /// Marks the subscription bound once the subscriber acknowledged it.
    fn set_bound(&self) {
        self.state.write().bound = true;
    }

    fn start_attempt(&self, epoch: Instant) {
        if self.num_attempts.load(Ordering::Acquire) == 0 {
            let micros = Instant::now().saturating_duration_since(epoch).as_micros() as u64;
            self.sub_started_at_micros.store(micros.max(1), Ordering::Release);
        }
    }

    fn record_attempt(&self, success: bool) {
        if success {
            self.num_attempts.store(0, Ordering::Release);
        } else {
            self.num_attempts.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn num_attempts(&self) -> u32 {
        self.num_attempts.load(Ordering::Acquire)
    }

    fn duration_since_start(&self, epoch: Instant) -> Duration {
        let micros = self.sub_started_at_micros.load(Ordering::Acquire);
        if micros == 0 {
            return Duration::ZERO;
        }
        let started_at = epoch + Duration::from_micros(micros);
        Instant::now().saturating_duration_since(started_at)
    }

    fn needs_subscribe(&self) -> bool {
        let state = self.state.read();
        state.desired && state.subscribed_track.is_none()
    }

    fn needs_unsubscribe(&self) -> bool {
        let state = self.state.read();
        !state.desired && state.subscribed_track.is_some()
    }

    fn needs_bind(&self) -> bool {
        let state = self.state.read();
        state.desired && state.subscribed_track.is_some() && !state.bound
    }
}

pub struct SubscriptionManagerParams {
    pub participant: Arc<dyn Participant>,
    pub track_resolver: TrackResolver,
    pub on_track_subscribed: Box<dyn Fn(Arc<dyn SubscribedTrack>) + Send + Sync>,
    pub on_track_unsubscribed: Box<dyn Fn(Arc<dyn SubscribedTrack>) + Send + Sync>,
    pub on_subscription_error: Box<dyn Fn(&TrackId) + Send + Sync>,
    pub telemetry: Arc<dyn Telemetry>,
}

struct ManagerState {
    subscriptions: HashMap<TrackId, Arc<TrackSubscription>>,
    subscribed_to: HashMap<ParticipantId, HashSet<TrackId>>,
}

struct ManagerInner {
    params: SubscriptionManagerParams,
    epoch: Instant,
    reconcile_interval: Duration,
    not_found_timeout: Duration,
    subscription_timeout: Duration,
    state: RwLock<ManagerState>,
    reconcile_tx: mpsc::Sender<TrackId>,
    closed: AtomicBool,
    on_subscribe_status_changed:
        Mutex<Option<Box<dyn Fn(&ParticipantId, bool) + Send + Sync>>>,
}

/// Manages a participant's subscriptions. Owns one reconcile worker; must be
/// created from within a tokio runtime.
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl SubscriptionManager {
    pub fn new(params: SubscriptionManagerParams, config: &Config) -> Self {
        let (reconcile_tx, reconcile_rx) = mpsc::channel(RECONCILE_QUEUE_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();
        let inner = Arc::new(ManagerInner {
            params,
            epoch: Instant::now(),
            reconcile_interval: Duration::from_millis(config.reconcile_interval_ms),
            not_found_timeout: Duration::from_millis(config.not_found_timeout_ms),
            subscription_timeout: Duration::from_millis(config.subscription_timeout_ms),
            state: RwLock::new(ManagerState {
                subscriptions: HashMap::new(),
                subscribed_to: HashMap::new(),
            }),
            reconcile_tx,
            closed: AtomicBool::new(false),
            on_subscribe_status_changed: Mutex::new(None),
        });
        let worker = tokio::spawn(ManagerInner::reconcile_worker(
            Arc::clone(&inner),
            close_rx,
            reconcile_rx,
        ));
        Self {
            inner,
            worker: Mutex::new(Some(worker)),
            close_tx: Mutex::new(Some(close_tx)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Signals close, waits for the worker to exit, then closes all
    /// downtracks; flushed unless the subscriptions will be resumed (ICE
    /// restart, reconnect). Idempotent.
    pub async fn close(&self, will_be_resumed: bool) {
        let close_tx = self.close_tx.lock().take();
        let Some(close_tx) = close_tx else {
            return;
        };
        self.inner.closed.store(true, Ordering::Release);
        let _ = close_tx.send(());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        for sub_track in self.get_subscribed_tracks() {
            sub_track.close_with_flush(!will_be_resumed);
        }
    }

    pub fn subscribe_to_track(
        &self,
        track_id: TrackId,
        publisher_identity: ParticipantIdentity,
        publisher_id: ParticipantId,
    ) {
        let sub = self.inner.get_or_create_subscription(&track_id);
        sub.set_publisher(publisher_identity.clone(), publisher_id.clone());
        if sub.set_desired(true) {
            info!(
                "subscribing to track: track_id: {}, publisher_id: {}, publisher_identity: {}",
                track_id, publisher_id, publisher_identity
            );
            self.inner.queue_reconcile(track_id);
        }
    }

    pub fn unsubscribe_from_track(&self, track_id: &TrackId) {
        let sub = self.inner.state.read().subscriptions.get(track_id).cloned();
        let Some(sub) = sub else {
            return;
        };
        if sub.set_desired(false) {
            info!(
                "unsubscribing from track: track_id: {}, publisher_id: {}",
                track_id,
                sub.publisher_id()
            );
            self.inner.queue_reconcile(track_id.clone());
        }
    }

    pub fn update_subscribed_track_settings(
        &self,
        track_id: TrackId,
        settings: SubscriberSettings,
    ) {
        let sub = self.inner.get_or_create_subscription(&track_id);
        sub.set_settings(settings);
    }

    pub fn get_subscribed_tracks(&self) -> Vec<Arc<dyn SubscribedTrack>> {
        let state = self.inner.state.read();
        state
            .subscriptions
            .values()
            .filter_map(|sub| sub.subscribed_track())
            .collect()
    }

    pub fn get_subscribed_participants(&self) -> Vec<ParticipantId> {
        let state = self.inner.state.read();
        state.subscribed_to.keys().cloned().collect()
    }

    pub fn is_subscribed_to(&self, participant_id: &ParticipantId) -> bool {
        let state = self.inner.state.read();
        state.subscribed_to.contains_key(participant_id)
    }

    pub fn has_subscriptions(&self) -> bool {
        let state = self.inner.state.read();
        state.subscriptions.values().any(|sub| sub.is_desired())
    }

    /// Fires once when the first track from a publisher is subscribed and
    /// once when the last one goes away.
    pub fn on_subscribe_status_changed(
        &self,
        callback: Box<dyn Fn(&ParticipantId, bool) + Send + Sync>,
    ) {
        *self.inner.on_subscribe_status_changed.lock() = Some(callback);
    }

    #[cfg(test)]
    fn subscription(&self, track_id: &TrackId) -> Option<Arc<TrackSubscription>> {
        self.inner.state.read().subscriptions.get(track_id).cloned()
    }
}

impl ManagerInner {
    async fn reconcile_worker(
        inner: Arc<ManagerInner>,
        mut close_rx: oneshot::Receiver<()>,
        mut reconcile_rx: mpsc::Receiver<TrackId>,
    ) {
        let mut tick = tokio::time::interval(inner.reconcile_interval.into());
        loop {
            tokio::select! {
                _ = &mut close_rx => {
                    return;
                }
                _ = tick.tick() => {
                    inner.reconcile_subscriptions();
                }
                track_id = reconcile_rx.recv() => {
                    match track_id {
                        Some(track_id) => {
                            let sub = inner.state.read().subscriptions.get(&track_id).cloned();
                            match sub {
                                Some(sub) => inner.reconcile_subscription(&sub),
                                None => inner.reconcile_subscriptions(),
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    fn get_or_create_subscription(self: &Arc<Self>, track_id: &TrackId) -> Arc<TrackSubscription> {
        let mut state = self.state.write();
        state
            .subscriptions
            .entry(track_id.clone())
            .or_insert_with(|| Arc::new(TrackSubscription::new(track_id.clone())))
            .clone()
    }

    /// Wakes the worker for one subscription. Dropping on overflow is fine;
    /// the periodic tick covers it.
    fn queue_reconcile(&self, track_id: TrackId) {
        let _ = self.reconcile_tx.try_send(track_id);
    }

    fn can_reconcile(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && !self.params.participant.is_closed()
            && !self.params.participant.is_disconnected()
    }

    fn reconcile_subscriptions(self: &Arc<Self>) {
        let needs_reconcile: Vec<Arc<TrackSubscription>> = {
            let state = self.state.read();
            state
                .subscriptions
                .values()
                .filter(|sub| {
                    sub.needs_subscribe() || sub.needs_unsubscribe() || sub.needs_bind()
                })
                .cloned()
                .collect()
        };

        for sub in needs_reconcile {
            self.reconcile_subscription(&sub);
        }
    }

    fn reconcile_subscription(self: &Arc<Self>, sub: &Arc<TrackSubscription>) {
        if !self.can_reconcile() {
            return;
        }

        if sub.needs_subscribe() {
            if sub.num_attempts() == 0 {
                self.params.telemetry.track_subscribe_requested(
                    &self.params.participant.id(),
                    sub.track_id(),
                    &sub.publisher_id(),
                    &sub.publisher_identity(),
                );
            }
            match self.subscribe(sub) {
                Ok(()) => sub.record_attempt(true),
                Err(err) => {
                    sub.record_attempt(false);
                    match err {
                        SubscriptionError::NoTrackPermission
                        | SubscriptionError::NoSubscribePermission
                        | SubscriptionError::TrackNotAttached => {
                            // Outside of our control; the publisher can grant
                            // permission any time and we will be re-queued.
                        }
                        SubscriptionError::PublisherNotConnected
                        | SubscriptionError::TrackNotFound => {
                            // Publisher left or track was unpublished. This
                            // is the only path that clears the desired flag.
                            if sub.duration_since_start(self.epoch) > self.not_found_timeout {
                                info!(
                                    "unsubscribing since track isn't available: track_id: {}, publisher_id: {}, publisher_identity: {}",
                                    sub.track_id(),
                                    sub.publisher_id(),
                                    sub.publisher_identity()
                                );
                                sub.set_desired(false);
                                self.queue_reconcile(sub.track_id().clone());
                            }
                        }
                        err => {
                            warn!(
                                "failed to subscribe: track_id: {}, attempt: {}, error: {}",
                                sub.track_id(),
                                sub.num_attempts(),
                                err
                            );
                            if sub.duration_since_start(self.epoch) > self.subscription_timeout {
                                (self.params.on_subscription_error)(sub.track_id());
                            }
                        }
                    }
                }
            }
            return;
        }

        if sub.needs_unsubscribe() {
            self.unsubscribe(sub);
            let mut state = self.state.write();
            if !sub.is_desired() {
                state.subscriptions.remove(sub.track_id());
            }
            return;
        }

        if !sub.is_desired() {
            // Nothing subscribed and nothing wanted; drop the bookkeeping
            // entry. This is how a not-found track leaves the map after its
            // desired flag was cleared.
            if sub.subscribed_track().is_none() {
                let mut state = self.state.write();
                state.subscriptions.remove(sub.track_id());
            }
            return;
        }

        if sub.needs_bind() && sub.duration_since_start(self.epoch) > self.subscription_timeout {
            error!(
                "track not bound after timeout: track_id: {}, publisher_id: {}, publisher_identity: {}",
                sub.track_id(),
                sub.publisher_id(),
                sub.publisher_identity()
            );
            (self.params.on_subscription_error)(sub.track_id());
        }
    }

    fn subscribe(self: &Arc<Self>, sub: &Arc<TrackSubscription>) -> Result<(), SubscriptionError> {
        sub.start_attempt(self.epoch);

        if !self.params.participant.can_subscribe() {
            return Err(SubscriptionError::NoSubscribePermission);
        }

        let publisher_id = sub.publisher_id();
        let resolution = (self.params.track_resolver)(
            &self.params.participant.identity(),
            &publisher_id,
            sub.track_id(),
        )?;

        let track = resolution.track;
        let permission_changed = sub.set_has_permission(resolution.has_permission);
        if permission_changed {
            self.params.participant.subscription_permission_update(
                &publisher_id,
                sub.track_id(),
                resolution.has_permission,
            );
        }
        if !resolution.has_permission {
            if permission_changed {
                let weak = Arc::downgrade(self);
                let track_id = sub.track_id().clone();
                track.add_change_observer(
                    self.params.participant.id(),
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.queue_reconcile(track_id.clone());
                        }
                    }),
                );
            }
            return Err(SubscriptionError::NoTrackPermission);
        }

        let sub_track = match track.add_subscriber(&self.params.participant) {
            Ok(sub_track) => sub_track,
            // Already satisfied.
            Err(SubscriptionError::AlreadySubscribed) => return Ok(()),
            Err(err) => return Err(err),
        };

        {
            let weak = Arc::downgrade(self);
            let sub = Arc::clone(sub);
            sub_track.on_close(Some(Box::new(move |will_be_resumed| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_subscribed_track_close(&sub, will_be_resumed);
                }
            })));
        }
        {
            let weak = Arc::downgrade(self);
            let sub = Arc::clone(sub);
            let bound_track = Arc::clone(&sub_track);
            sub_track.add_on_bind(Box::new(move || {
                sub.set_bound();
                if let Some(inner) = weak.upgrade() {
                    inner.params.telemetry.track_subscribed(
                        &inner.params.participant.id(),
                        sub.track_id(),
                        &bound_track.publisher_id(),
                        &bound_track.publisher_identity(),
                    );
                }
            }));
        }
        sub.set_subscribed_track(Some(Arc::clone(&sub_track)));

        if sub_track.needs_negotiation() {
            self.params.participant.negotiate(false);
        }

        let first_subscribe = {
            let mut state = self.state.write();
            let tracks = state.subscribed_to.entry(publisher_id.clone()).or_default();
            let first = tracks.is_empty();
            tracks.insert(sub.track_id().clone());
            first
        };

        (self.params.on_track_subscribed)(Arc::clone(&sub_track));

        if first_subscribe {
            if let Some(callback) = self.on_subscribe_status_changed.lock().as_ref() {
                callback(&publisher_id, true);
            }
        }
        Ok(())
    }

    fn unsubscribe(&self, sub: &Arc<TrackSubscription>) {
        let Some(sub_track) = sub.subscribed_track() else {
            // Already unsubscribed.
            return;
        };
        let track = sub_track.media_track();
        let participant_id = self.params.participant.id();
        track.remove_change_observer(&participant_id);
        track.remove_subscriber(&participant_id, false);
    }

    /// The publisher closing the downtrack is how it signals the subscription
    /// is no longer fulfilled: subscriber-initiated unsubscribe, the uptrack
    /// closing, or a permission revocation.
    fn handle_subscribed_track_close(
        self: &Arc<Self>,
        sub: &Arc<TrackSubscription>,
        will_be_resumed: bool,
    ) {
        debug!(
            "subscribed track closed: track_id: {}, publisher_id: {}, will_be_resumed: {}",
            sub.track_id(),
            sub.publisher_id(),
            will_be_resumed
        );
        let Some(sub_track) = sub.subscribed_track() else {
            return;
        };

        let publisher_id = sub.publisher_id();
        let last_subscription = {
            let mut state = self.state.write();
            match state.subscribed_to.get_mut(&publisher_id) {
                Some(tracks) => {
                    tracks.remove(sub.track_id());
                    if tracks.is_empty() {
                        state.subscribed_to.remove(&publisher_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if last_subscription {
            if let Some(callback) = self.on_subscribe_status_changed.lock().as_ref() {
                callback(&publisher_id, false);
            }
        }

        sub_track.on_close(None);
        sub.set_subscribed_track(None);
        (self.params.on_track_unsubscribed)(Arc::clone(&sub_track));

        if !will_be_resumed {
            if !self.params.participant.is_closed() {
                self.params
                    .telemetry
                    .track_unsubscribed(&self.params.participant.id(), sub.track_id());
            }

            if let Err(err) = self
                .params
                .participant
                .remove_track_from_subscriber(Arc::clone(&sub_track))
            {
                // Usually benign; the sender may already be inactive.
                debug!(
                    "could not remove track from subscriber: track_id: {}, error: {}",
                    sub.track_id(),
                    err
                );
            }
            self.params.participant.negotiate(false);
        }
        self.queue_reconcile(sub.track_id().clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_test_config;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[derive(Default)]
    struct FakeParticipantState {
        negotiate_count: u32,
        permission_updates: Vec<(ParticipantId, TrackId, bool)>,
        removed_tracks: u32,
    }

    struct FakeParticipant {
        id: ParticipantId,
        identity: ParticipantIdentity,
        can_subscribe: AtomicBool,
        closed: AtomicBool,
        state: Mutex<FakeParticipantState>,
    }

    impl FakeParticipant {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                id: ParticipantId::from(format!("PA_{name}")),
                identity: ParticipantIdentity::from(name),
                can_subscribe: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                state: Mutex::new(FakeParticipantState::default()),
            })
        }
    }

    impl Participant for FakeParticipant {
        fn id(&self) -> ParticipantId {
            self.id.clone()
        }
        fn identity(&self) -> ParticipantIdentity {
            self.identity.clone()
        }
        fn can_subscribe(&self) -> bool {
            self.can_subscribe.load(Ordering::Acquire)
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
        fn is_disconnected(&self) -> bool {
            false
        }
        fn negotiate(&self, _force: bool) {
            self.state.lock().negotiate_count += 1;
        }
        fn remove_track_from_subscriber(
            &self,
            _track: Arc<dyn SubscribedTrack>,
        ) -> anyhow::Result<()> {
            self.state.lock().removed_tracks += 1;
            Ok(())
        }
        fn subscription_permission_update(
            &self,
            publisher_id: &ParticipantId,
            track_id: &TrackId,
            has_permission: bool,
        ) {
            self.state.lock().permission_updates.push((
                publisher_id.clone(),
                track_id.clone(),
                has_permission,
            ));
        }
    }

    struct FakeSubscribedTrack {
        media_track: Arc<FakeMediaTrack>,
        on_close: Mutex<Option<Box<dyn Fn(bool) + Send + Sync>>>,
        on_bind: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
        settings: Mutex<Option<SubscriberSettings>>,
        flushed: Mutex<Option<bool>>,
    }

    impl FakeSubscribedTrack {
        fn bind(&self) {
            let callbacks = self.on_bind.lock();
            for callback in callbacks.iter() {
                callback();
            }
        }

        fn fire_close(&self, will_be_resumed: bool) {
            let callback = self.on_close.lock().take();
            if let Some(callback) = callback {
                callback(will_be_resumed);
            }
        }
    }

    impl SubscribedTrack for FakeSubscribedTrack {
        fn on_close(&self, callback: Option<Box<dyn Fn(bool) + Send + Sync>>) {
            *self.on_close.lock() = callback;
        }
        fn add_on_bind(&self, callback: Box<dyn Fn() + Send + Sync>) {
            self.on_bind.lock().push(callback);
        }
        fn needs_negotiation(&self) -> bool {
            true
        }
        fn media_track(&self) -> Arc<dyn MediaTrack> {
            Arc::clone(&self.media_track) as Arc<dyn MediaTrack>
        }
        fn publisher_id(&self) -> ParticipantId {
            self.media_track.publisher_id.clone()
        }
        fn publisher_identity(&self) -> ParticipantIdentity {
            self.media_track.publisher_identity.clone()
        }
        fn update_subscriber_settings(&self, settings: &SubscriberSettings) {
            *self.settings.lock() = Some(settings.clone());
        }
        fn close_with_flush(&self, flush: bool) {
            *self.flushed.lock() = Some(flush);
        }
    }

    struct FakeMediaTrack {
        id: TrackId,
        publisher_id: ParticipantId,
        publisher_identity: ParticipantIdentity,
        self_ref: std::sync::Weak<FakeMediaTrack>,
        subscribers: Mutex<HashMap<ParticipantId, Arc<FakeSubscribedTrack>>>,
        observers: Mutex<HashMap<ParticipantId, Box<dyn Fn() + Send + Sync>>>,
    }

    impl FakeMediaTrack {
        fn new(id: &str, publisher: &str) -> Arc<Self> {
            Arc::new_cyclic(|self_ref| Self {
                id: TrackId::from(id),
                publisher_id: ParticipantId::from(format!("PA_{publisher}")),
                publisher_identity: ParticipantIdentity::from(publisher),
                self_ref: self_ref.clone(),
                subscribers: Mutex::new(HashMap::new()),
                observers: Mutex::new(HashMap::new()),
            })
        }

        fn subscribed_track_for(
            self: &Arc<Self>,
            subscriber_id: &ParticipantId,
        ) -> Option<Arc<FakeSubscribedTrack>> {
            self.subscribers.lock().get(subscriber_id).cloned()
        }

        fn notify_observers(&self) {
            let observers = self.observers.lock();
            for observer in observers.values() {
                observer();
            }
        }
    }

    impl MediaTrack for FakeMediaTrack {
        fn id(&self) -> TrackId {
            self.id.clone()
        }
        fn add_subscriber(
            &self,
            subscriber: &Arc<dyn Participant>,
        ) -> Result<Arc<dyn SubscribedTrack>, SubscriptionError> {
            let mut subscribers = self.subscribers.lock();
            if let Some(existing) = subscribers.get(&subscriber.id()) {
                return Ok(Arc::clone(existing) as Arc<dyn SubscribedTrack>);
            }
            let sub_track = Arc::new(FakeSubscribedTrack {
                media_track: self.self_ref.upgrade().expect("track alive"),
                on_close: Mutex::new(None),
                on_bind: Mutex::new(Vec::new()),
                settings: Mutex::new(None),
                flushed: Mutex::new(None),
            });
            subscribers.insert(subscriber.id(), Arc::clone(&sub_track));
            Ok(sub_track as Arc<dyn SubscribedTrack>)
        }
        fn remove_subscriber(&self, subscriber_id: &ParticipantId, _will_be_resumed: bool) {
            let sub_track = self.subscribers.lock().remove(subscriber_id);
            if let Some(sub_track) = sub_track {
                sub_track.fire_close(false);
            }
        }
        fn add_change_observer(
            &self,
            subscriber_id: ParticipantId,
            observer: Box<dyn Fn() + Send + Sync>,
        ) {
            self.observers.lock().insert(subscriber_id, observer);
        }
        fn remove_change_observer(&self, subscriber_id: &ParticipantId) {
            self.observers.lock().remove(subscriber_id);
        }
    }

    #[derive(Default)]
    struct FakeTelemetry {
        events: Mutex<Vec<String>>,
    }

    impl FakeTelemetry {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl Telemetry for FakeTelemetry {
        fn track_subscribe_requested(
            &self,
            _participant_id: &ParticipantId,
            track_id: &TrackId,
            _publisher_id: &ParticipantId,
            _publisher_identity: &ParticipantIdentity,
        ) {
            self.events.lock().push(format!("requested:{track_id}"));
        }
        fn track_subscribed(
            &self,
            _participant_id: &ParticipantId,
            track_id: &TrackId,
            _publisher_id: &ParticipantId,
            _publisher_identity: &ParticipantIdentity,
        ) {
            self.events.lock().push(format!("subscribed:{track_id}"));
        }
        fn track_unsubscribed(&self, _participant_id: &ParticipantId, track_id: &TrackId) {
            self.events.lock().push(format!("unsubscribed:{track_id}"));
        }
    }

    type ResolverBehavior =
        Arc<Mutex<Box<dyn Fn(&TrackId) -> Result<TrackResolution, SubscriptionError> + Send>>>;

    struct Harness {
        manager: SubscriptionManager,
        participant: Arc<FakeParticipant>,
        telemetry: Arc<FakeTelemetry>,
        resolver: ResolverBehavior,
        status_changes: Arc<Mutex<Vec<(ParticipantId, bool)>>>,
        errors: Arc<Mutex<Vec<TrackId>>>,
    }

    fn new_harness() -> Harness {
        init_logging();
        let participant = FakeParticipant::new("subscriber");
        let telemetry = Arc::new(FakeTelemetry::default());
        let resolver: ResolverBehavior = Arc::new(Mutex::new(Box::new(|_track_id: &TrackId| {
            Err(SubscriptionError::TrackNotFound)
        })));
        let status_changes: Arc<Mutex<Vec<(ParticipantId, bool)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let errors: Arc<Mutex<Vec<TrackId>>> = Arc::new(Mutex::new(Vec::new()));

        let resolver_for_params = Arc::clone(&resolver);
        let errors_for_params = Arc::clone(&errors);
        let params = SubscriptionManagerParams {
            participant: Arc::clone(&participant) as Arc<dyn Participant>,
            track_resolver: Box::new(move |_identity, _publisher_id, track_id| {
                (*resolver_for_params.lock())(track_id)
            }),
            on_track_subscribed: Box::new(|_sub_track| {}),
            on_track_unsubscribed: Box::new(|_sub_track| {}),
            on_subscription_error: Box::new(move |track_id| {
                errors_for_params.lock().push(track_id.clone());
            }),
            telemetry: Arc::clone(&telemetry) as Arc<dyn Telemetry>,
        };
        let manager = SubscriptionManager::new(params, &default_test_config());
        let status_for_callback = Arc::clone(&status_changes);
        manager.on_subscribe_status_changed(Box::new(move |publisher_id, subscribed| {
            status_for_callback
                .lock()
                .push((publisher_id.clone(), subscribed));
        }));

        Harness {
            manager,
            participant,
            telemetry,
            resolver,
            status_changes,
            errors,
        }
    }

    fn resolve_to(harness: &Harness, track: &Arc<FakeMediaTrack>, has_permission: bool) {
        let track = Arc::clone(track);
        *harness.resolver.lock() = Box::new(move |_track_id| {
            Ok(TrackResolution {
                track: Arc::clone(&track) as Arc<dyn MediaTrack>,
                has_permission,
            })
        });
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            if Instant::now() > deadline {
                panic!("condition not reached in time");
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn subscribe_success() {
        let harness = new_harness();
        let track = FakeMediaTrack::new("TR_video", "publisher");
        resolve_to(&harness, &track, true);

        harness.manager.subscribe_to_track(
            TrackId::from("TR_video"),
            ParticipantIdentity::from("publisher"),
            ParticipantId::from("PA_publisher"),
        );

        wait_until(|| harness.manager.get_subscribed_tracks().len() == 1).await;
        assert!(harness
            .manager
            .is_subscribed_to(&ParticipantId::from("PA_publisher")));
        assert!(harness.manager.has_subscriptions());
        assert_eq!(
            vec![(ParticipantId::from("PA_publisher"), true)],
            harness.status_changes.lock().clone()
        );

        // Binding completes the subscription and emits telemetry.
        let sub_track = track
            .subscribed_track_for(&harness.participant.id)
            .expect("subscribed");
        sub_track.bind();
        wait_until(|| {
            harness
                .telemetry
                .events()
                .contains(&"subscribed:TR_video".to_string())
        })
        .await;
        assert!(harness
            .telemetry
            .events()
            .contains(&"requested:TR_video".to_string()));

        harness.manager.close(false).await;
        assert_eq!(Some(true), *sub_track.flushed.lock());
    }

    #[tokio::test]
    async fn track_not_found_clears_desired_after_timeout() {
        let harness = new_harness();
        // Resolver keeps failing with TrackNotFound (the default behavior).

        harness.manager.subscribe_to_track(
            TrackId::from("TR_gone"),
            ParticipantIdentity::from("publisher"),
            ParticipantId::from("PA_publisher"),
        );

        // Desired flips off after not_found_timeout, and the subscription is
        // removed on the following reconcile pass.
        wait_until(|| harness.manager.subscription(&TrackId::from("TR_gone")).is_none()).await;
        assert!(!harness.manager.has_subscriptions());
        assert!(harness.errors.lock().is_empty());

        harness.manager.close(false).await;
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscription() {
        let harness = new_harness();
        let track = FakeMediaTrack::new("TR_video", "publisher");
        resolve_to(&harness, &track, true);

        harness.manager.subscribe_to_track(
            TrackId::from("TR_video"),
            ParticipantIdentity::from("publisher"),
            ParticipantId::from("PA_publisher"),
        );
        wait_until(|| harness.manager.get_subscribed_tracks().len() == 1).await;

        harness.manager.unsubscribe_from_track(&TrackId::from("TR_video"));
        wait_until(|| {
            harness
                .manager
                .subscription(&TrackId::from("TR_video"))
                .is_none()
        })
        .await;

        assert!(!harness
            .manager
            .is_subscribed_to(&ParticipantId::from("PA_publisher")));
        assert_eq!(
            vec![
                (ParticipantId::from("PA_publisher"), true),
                (ParticipantId::from("PA_publisher"), false),
            ],
            harness.status_changes.lock().clone()
        );
        assert!(harness
            .telemetry
            .events()
            .contains(&"unsubscribed:TR_video".to_string()));
        assert!(harness.participant.state.lock().removed_tracks >= 1);

        harness.manager.close(false).await;
    }

    #[tokio::test]
    async fn no_permission_waits_for_change() {
        let harness = new_harness();
        let track = FakeMediaTrack::new("TR_video", "publisher");
        resolve_to(&harness, &track, false);

        harness.manager.subscribe_to_track(
            TrackId::from("TR_video"),
            ParticipantIdentity::from("publisher"),
            ParticipantId::from("PA_publisher"),
        );

        // The permission downgrade is surfaced and an observer installed.
        wait_until(|| !harness.participant.state.lock().permission_updates.is_empty()).await;
        assert_eq!(
            (
                ParticipantId::from("PA_publisher"),
                TrackId::from("TR_video"),
                false
            ),
            harness.participant.state.lock().permission_updates[0]
        );
        assert!(harness.manager.get_subscribed_tracks().is_empty());

        // Permission granted: the observer wakes the reconciler.
        resolve_to(&harness, &track, true);
        track.notify_observers();
        wait_until(|| harness.manager.get_subscribed_tracks().len() == 1).await;

        harness.manager.close(false).await;
    }

    #[tokio::test]
    async fn settings_are_applied_when_track_arrives() {
        let harness = new_harness();
        let track = FakeMediaTrack::new("TR_video", "publisher");

        harness.manager.update_subscribed_track_settings(
            TrackId::from("TR_video"),
            SubscriberSettings {
                muted: false,
                max_height: Some(720),
                priority: None,
            },
        );

        resolve_to(&harness, &track, true);
        harness.manager.subscribe_to_track(
            TrackId::from("TR_video"),
            ParticipantIdentity::from("publisher"),
            ParticipantId::from("PA_publisher"),
        );
        wait_until(|| harness.manager.get_subscribed_tracks().len() == 1).await;

        let sub_track = track
            .subscribed_track_for(&harness.participant.id)
            .expect("subscribed");
        assert_eq!(
            Some(SubscriberSettings {
                muted: false,
                max_height: Some(720),
                priority: None,
            }),
            *sub_track.settings.lock()
        );

        harness.manager.close(false).await;
    }

    #[tokio::test]
    async fn persistent_failure_raises_subscription_error() {
        let harness = new_harness();
        *harness.resolver.lock() =
            Box::new(|_track_id| Err(SubscriptionError::Other("resolver broken".to_string())));

        harness.manager.subscribe_to_track(
            TrackId::from("TR_video"),
            ParticipantIdentity::from("publisher"),
            ParticipantId::from("PA_publisher"),
        );

        wait_until(|| !harness.errors.lock().is_empty()).await;
        assert_eq!(TrackId::from("TR_video"), harness.errors.lock()[0]);
        // The desire is not cleared; retries continue.
        assert!(harness.manager.has_subscriptions());

        harness.manager.close(false).await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_keeps_downtracks_on_resume() {
        let harness = new_harness();
        let track = FakeMediaTrack::new("TR_video", "publisher");
        resolve_to(&harness, &track, true);

        harness.manager.subscribe_to_track(
            TrackId::from("TR_video"),
            ParticipantIdentity::from("publisher"),
            ParticipantId::from("PA_publisher"),
        );
        wait_until(|| harness.manager.get_subscribed_tracks().len() == 1).await;

        let sub_track = track
            .subscribed_track_for(&harness.participant.id)
            .expect("subscribed");

        harness.manager.close(true).await;
        assert!(harness.manager.is_closed());
        // flush = !will_be_resumed
        assert_eq!(Some(false), *sub_track.flushed.lock());

        // A second close is a no-op.
        harness.manager.close(false).await;
        assert_eq!(Some(false), *sub_track.flushed.lock());
    }
}
