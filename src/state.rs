use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::observability::metrics::Metrics;
use crate::realtime::notifier::Notifier;
use crate::store::Store;

pub struct AppState {
    pub store: Store,
    pub notifier: Notifier,
    pub rematch_tx: mpsc::Sender<Uuid>,
    pub metrics: Metrics,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> (Self, mpsc::Receiver<Uuid>) {
        let (rematch_tx, rematch_rx) = mpsc::channel(config.rematch_queue_size.max(1));
        let metrics = Metrics::new();

        (
            Self {
                store: Store::new(),
                notifier: Notifier::new(config.connection_buffer_size, metrics.clone()),
                rematch_tx,
                metrics,
                config,
            },
            rematch_rx,
        )
    }
}
