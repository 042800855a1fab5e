//! # ps-plugins
//!
//! Plugin sinks and the fan-out feeding them. Each configured plugin owns a
//! bounded input queue; the fan-out forwards every uncompressed batch to
//! all of them with independent drop-on-full semantics, so one slow plugin
//! never stalls another.

mod error;
pub mod kafka;
pub mod s3;

pub use error::PluginError;

use ps_config::Config;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

pub(crate) const PLUGIN_QUEUE_LEN: usize = 100;

/// Running plugin pipelines: the fan-out input plus the task handles the
/// orchestrator joins on shutdown so partial uploads get flushed before
/// the process exits.
pub struct Plugins {
    tx: mpsc::Sender<Vec<u8>>,
    fanout: tokio::task::JoinHandle<()>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Plugins {
    /// A sender feeding every configured plugin.
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.tx.clone()
    }

    /// Close the fan-out and wait for every plugin to flush and stop.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.fanout.await;
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Start every configured plugin and the fan-out in front of them.
///
/// Returns `None` when no plugin is configured. Closing the fan-out (or
/// cancelling the token) lets every plugin flush its partial state and
/// stop.
pub async fn start(
    config: &Config,
    stop: CancellationToken,
) -> Result<Option<Plugins>, PluginError> {
    let plugins_config = match &config.output.plugins {
        Some(plugins_config) => plugins_config,
        None => return Ok(None),
    };

    let mut sinks: Vec<(&'static str, mpsc::Sender<Vec<u8>>)> = Vec::new();
    let mut tasks = Vec::new();

    if let Some(s3_config) = &plugins_config.s3 {
        let store = s3::AwsObjectStore::new(s3_config.region.clone()).await;
        let header = ps_capture::records::file_header(config.input_packet_len as u32);
        let plugin = s3::S3Plugin::new(store, s3_config, header);
        let (sink, task) = plugin.start(stop.child_token());
        sinks.push(("s3", sink));
        tasks.push(task);
    }

    if let Some(kafka_config) = &plugins_config.kafka {
        let producer = kafka::KafkaProducer::new(&kafka_config.brokers)?;
        let plugin = kafka::KafkaPlugin::new(producer, kafka_config);
        let (sink, task) = plugin.start(stop.child_token());
        sinks.push(("kafka", sink));
        tasks.push(task);
    }

    if sinks.is_empty() {
        return Ok(None);
    }

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PLUGIN_QUEUE_LEN);
    let fanout = tokio::spawn(async move {
        loop {
            let chunk = tokio::select! {
                _ = stop.cancelled() => break,
                chunk = rx.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };
            for (name, sink) in &sinks {
                if let Err(TrySendError::Full(_)) = sink.try_send(chunk.clone()) {
                    log::warn!("{} plugin queue is full. Discarding", name);
                }
            }
        }
        // Dropping the per-plugin senders closes their queues, which lets
        // each plugin publish its partial buffer and exit.
    });

    Ok(Some(Plugins { tx, fanout, tasks }))
}
