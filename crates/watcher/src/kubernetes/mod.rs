//! Resource-store plumbing: typed update records, subscriptions and the
//! per-kind watch tasks.
//!
//! Callers register subscriptions against a [`Watcher`] before watching
//! starts; each subscription pairs a [`Selector`] with a typed sink
//! channel. [`Watcher::start`] then spawns one supervised watch stream
//! per resource kind, which demultiplexes incoming events to every
//! matching subscription.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::api::Api;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod selector;
mod watch;

pub use selector::{Selector, SelectorError};
pub use watch::WatchError;

/// The resource kinds the watcher can observe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// A `v1/ConfigMap`.
    ConfigMap,
    /// A `v1/Secret`.
    Secret,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::ConfigMap => write!(f, "ConfigMap"),
            ResourceKind::Secret => write!(f, "Secret"),
        }
    }
}

/// The type of change a watch event describes.
///
/// The variant set is closed on purpose: every consumer matches on it
/// exhaustively, so a new event type is a compile-time-checked change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// The resource appeared (or was present when the watch opened).
    Added,
    /// The resource was updated in place.
    Modified,
    /// The resource was removed.
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Added => write!(f, "ADDED"),
            EventType::Modified => write!(f, "MODIFIED"),
            EventType::Deleted => write!(f, "DELETED"),
        }
    }
}

/// One observed change to a watched resource.
///
/// Each record corresponds to exactly one watch-stream event; records
/// are never synthesized or merged.
#[derive(Clone, Debug)]
pub struct Update<D> {
    /// The type of change observed.
    pub event_type: EventType,
    /// The kind of the changed resource.
    pub kind: ResourceKind,
    /// Namespace of the changed resource.
    pub namespace: String,
    /// Name of the changed resource.
    pub name: String,
    /// The resource's label set at the time of the event.
    pub labels: BTreeMap<String, String>,
    /// The resource's data payload.
    pub data: D,
}

impl<D> Update<D> {
    /// Formats the resource coordinates for log correlation.
    pub fn meta(&self) -> String {
        format!("{}({}/{})", self.kind, self.namespace, self.name)
    }
}

impl<D> fmt::Display for Update<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.event_type, self.meta())
    }
}

/// Payload carried by ConfigMap update records.
pub type ConfigMapData = BTreeMap<String, String>;
/// Payload carried by Secret update records.
pub type SecretData = BTreeMap<String, ByteString>;

/// An update record for a ConfigMap.
pub type ConfigMapUpdate = Update<ConfigMapData>;
/// An update record for a Secret.
pub type SecretUpdate = Update<SecretData>;

/// A namespaced resource kind the watcher knows how to observe.
pub trait Watched:
    kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
    /// Payload type carried by update records for this kind.
    type Data: Clone + Send + Sync + 'static;

    /// Kind tag stamped on update records.
    const KIND: ResourceKind;

    /// Extracts the data payload from the resource.
    fn data(self) -> Self::Data;
}

impl Watched for ConfigMap {
    type Data = ConfigMapData;

    const KIND: ResourceKind = ResourceKind::ConfigMap;

    fn data(self) -> Self::Data {
        self.data.unwrap_or_default()
    }
}

impl Watched for Secret {
    type Data = SecretData;

    const KIND: ResourceKind = ResourceKind::Secret;

    fn data(self) -> Self::Data {
        self.data.unwrap_or_default()
    }
}

fn update_from<K: Watched>(event_type: EventType, object: K) -> Update<K::Data> {
    let name = object.name();
    let namespace = object.namespace().unwrap_or_default();
    let labels = object.labels().clone();
    Update {
        event_type,
        kind: K::KIND,
        namespace,
        name,
        labels,
        data: object.data(),
    }
}

/// Buffering policy for a subscription's sink channel.
///
/// All variants block rather than drop: a slow consumer throttles its
/// kind's watch stream instead of losing events.
#[derive(Clone, Copy, Debug)]
pub enum SinkBuffer {
    /// Capacity-one channel: the watcher runs at most one record ahead
    /// of the consumer, the closest to an unbuffered blocking send.
    Rendezvous,
    /// Bounded channel with the given capacity.
    Bounded(usize),
    /// The watcher never waits; memory grows with consumer lag.
    Unbounded,
}

impl Default for SinkBuffer {
    fn default() -> Self {
        SinkBuffer::Rendezvous
    }
}

pub(crate) enum UpdateSender<D> {
    Bounded(mpsc::Sender<Update<D>>),
    Unbounded(mpsc::UnboundedSender<Update<D>>),
}

/// Error returned when a subscription's consumer has gone away.
#[derive(Debug)]
pub(crate) struct SinkClosed;

impl<D> UpdateSender<D> {
    pub(crate) async fn send(&self, update: Update<D>) -> Result<(), SinkClosed> {
        match self {
            UpdateSender::Bounded(tx) => tx.send(update).await.map_err(|_| SinkClosed),
            UpdateSender::Unbounded(tx) => tx.send(update).map_err(|_| SinkClosed),
        }
    }
}

enum ReceiverKind<D> {
    Bounded(mpsc::Receiver<Update<D>>),
    Unbounded(mpsc::UnboundedReceiver<Update<D>>),
}

/// Receiving half of a subscription.
pub struct UpdateReceiver<D>(ReceiverKind<D>);

impl<D> UpdateReceiver<D> {
    /// Receives the next update record.
    ///
    /// Returns `None` once the watch task has stopped and all buffered
    /// records have been taken.
    pub async fn recv(&mut self) -> Option<Update<D>> {
        match &mut self.0 {
            ReceiverKind::Bounded(rx) => rx.recv().await,
            ReceiverKind::Unbounded(rx) => rx.recv().await,
        }
    }
}

pub(crate) fn channel<D>(buffer: SinkBuffer) -> (UpdateSender<D>, UpdateReceiver<D>) {
    match buffer {
        SinkBuffer::Rendezvous => {
            let (tx, rx) = mpsc::channel(1);
            (
                UpdateSender::Bounded(tx),
                UpdateReceiver(ReceiverKind::Bounded(rx)),
            )
        }
        SinkBuffer::Bounded(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (
                UpdateSender::Bounded(tx),
                UpdateReceiver(ReceiverKind::Bounded(rx)),
            )
        }
        SinkBuffer::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                UpdateSender::Unbounded(tx),
                UpdateReceiver(ReceiverKind::Unbounded(rx)),
            )
        }
    }
}

/// A registered (selector, sink) pair for one resource kind.
pub(crate) struct Subscription<D> {
    pub(crate) selector: Selector,
    pub(crate) sink: UpdateSender<D>,
}

/// Registry of subscriptions and entry point for watching.
///
/// Subscriptions must all be registered before [`Watcher::start`] is
/// called; the watcher spawns one watch stream per resource kind no
/// matter how many subscriptions exist for it.
pub struct Watcher {
    client: kube::Client,
    namespace: String,
    config_maps: Vec<Subscription<ConfigMapData>>,
    secrets: Vec<Subscription<SecretData>>,
}

impl Watcher {
    /// Creates a watcher over the given namespace.
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Watcher {
            client,
            namespace: namespace.into(),
            config_maps: Vec::new(),
            secrets: Vec::new(),
        }
    }

    /// Registers a ConfigMap subscription and returns its receiving end.
    pub fn subscribe_config_maps(
        &mut self,
        selector: Selector,
        buffer: SinkBuffer,
    ) -> UpdateReceiver<ConfigMapData> {
        let (sink, receiver) = channel(buffer);
        self.config_maps.push(Subscription { selector, sink });
        receiver
    }

    /// Registers a Secret subscription and returns its receiving end.
    pub fn subscribe_secrets(
        &mut self,
        selector: Selector,
        buffer: SinkBuffer,
    ) -> UpdateReceiver<SecretData> {
        let (sink, receiver) = channel(buffer);
        self.secrets.push(Subscription { selector, sink });
        receiver
    }

    /// Spawns one supervised watch task per resource kind that has
    /// subscriptions. The tasks run until the token is cancelled.
    pub fn start(self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let Watcher {
            client,
            namespace,
            config_maps,
            secrets,
        } = self;

        let mut tasks = Vec::new();
        if !config_maps.is_empty() {
            let api = Api::<ConfigMap>::namespaced(client.clone(), &namespace);
            tasks.push(tokio::spawn(watch::supervise(
                api,
                config_maps,
                token.clone(),
            )));
        }
        if !secrets.is_empty() {
            let api = Api::<Secret>::namespaced(client, &namespace);
            tasks.push(tokio::spawn(watch::supervise(api, secrets, token.clone())));
        }
        tasks
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn update(name: &str) -> ConfigMapUpdate {
        Update {
            event_type: EventType::Added,
            kind: ResourceKind::ConfigMap,
            namespace: "monitoring".to_string(),
            name: name.to_string(),
            labels: BTreeMap::new(),
            data: BTreeMap::new(),
        }
    }

    #[test]
    fn updates_format_with_event_and_coordinates() {
        let update = update("cm-1");
        assert_eq!(update.meta(), "ConfigMap(monitoring/cm-1)");
        assert_eq!(update.to_string(), "ADDED(ConfigMap(monitoring/cm-1))");
    }

    #[tokio::test]
    async fn unbounded_sink_never_blocks_the_sender() {
        let (sink, mut receiver) = channel(SinkBuffer::Unbounded);
        for i in 0..100 {
            sink.send(update(&format!("cm-{}", i))).await.unwrap();
        }
        drop(sink);
        let mut received = 0;
        while receiver.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 100);
    }

    #[tokio::test]
    async fn bounded_sink_blocks_once_its_capacity_is_reached() {
        let (sink, _receiver) = channel(SinkBuffer::Bounded(2));
        sink.send(update("cm-1")).await.unwrap();
        sink.send(update("cm-2")).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(20), sink.send(update("cm-3"))).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn rendezvous_sink_hands_each_update_straight_to_the_consumer() {
        let (sink, mut receiver) = channel(SinkBuffer::Rendezvous);
        sink.send(update("cm-1")).await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_millis(20), sink.send(update("cm-2"))).await;
        assert!(blocked.is_err());

        assert_eq!(receiver.recv().await.unwrap().name, "cm-1");
        sink.send(update("cm-2")).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap().name, "cm-2");
    }
}
