//! Message-broker sink.
//!
//! Data is grouped into "files": every file gets a UUID used as the message
//! key, and its first message starts with the 4-byte stream magic. Records
//! are sliced into message-sized chunks; once `file_size` bytes have been
//! published under one id, the next file begins.

use std::future::Future;

use ps_config::KafkaPluginConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::PluginError;

/// Broker publish operation, injectable for tests.
pub trait MessageProducer: Send + Sync + 'static {
    fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), PluginError>> + Send;
}

/// Producer backed by rdkafka.
pub struct KafkaProducer {
    inner: FutureProducer,
}

impl KafkaProducer {
    pub fn new(brokers: &[String]) -> Result<Self, PluginError> {
        let inner: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("message.timeout.ms", "10000")
            .create()
            .map_err(|e| PluginError::Kafka(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl MessageProducer for KafkaProducer {
    fn send(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), PluginError>> + Send {
        async move {
            let record = FutureRecord::to(topic).key(key).payload(&payload);
            self.inner
                .send(record, Timeout::Never)
                .await
                .map(|_| ())
                .map_err(|(e, _)| PluginError::Kafka(e.to_string()))
        }
    }
}

struct BrokerFile {
    id: String,
    buffer: Vec<u8>,
    sent: u64,
}

pub struct KafkaPlugin<P: MessageProducer> {
    producer: P,
    topic: String,
    message_size: usize,
    file_size: u64,
    file_header: Vec<u8>,
}

impl<P: MessageProducer> KafkaPlugin<P> {
    pub fn new(producer: P, config: &KafkaPluginConfig) -> Self {
        Self {
            producer,
            topic: config.topic.clone(),
            message_size: config.message_size,
            file_size: config.file_size,
            file_header: ps_streamer::frame::MAGIC.to_vec(),
        }
    }

    /// Spawn the sink task and return its input queue and join handle.
    pub fn start(
        self,
        stop: CancellationToken,
    ) -> (mpsc::Sender<Vec<u8>>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(crate::PLUGIN_QUEUE_LEN);
        let task = tokio::spawn(self.run(rx, stop));
        (tx, task)
    }

    fn new_file(&self) -> BrokerFile {
        let mut buffer = Vec::with_capacity(self.message_size);
        buffer.extend_from_slice(&self.file_header);
        BrokerFile {
            id: Uuid::new_v4().to_string(),
            buffer,
            sent: 0,
        }
    }

    async fn run(self, mut rx: mpsc::Receiver<Vec<u8>>, stop: CancellationToken) {
        let mut file = self.new_file();

        loop {
            let pkt = tokio::select! {
                _ = stop.cancelled() => break,
                pkt = rx.recv() => match pkt {
                    Some(pkt) => pkt,
                    None => break,
                },
            };

            if file.buffer.len() + pkt.len() < self.message_size {
                file.buffer.extend_from_slice(&pkt);
                continue;
            }

            // Slice the record into message-sized chunks and publish each
            // one under the current file id.
            let mut read_from = 0;
            while read_from < pkt.len() {
                let to_take = self.message_size - file.buffer.len();
                let end = (read_from + to_take).min(pkt.len());
                file.buffer.extend_from_slice(&pkt[read_from..end]);
                read_from = end;

                if let Err(e) = self.flush(&mut file).await {
                    log::error!("could not publish broker message: {}", e);
                    return;
                }
                if file.sent >= self.file_size {
                    file = self.new_file();
                } else {
                    file.buffer = Vec::with_capacity(self.message_size);
                }
            }
        }

        // A partial message larger than the header still goes out.
        if file.buffer.len() > self.file_header.len() {
            if let Err(e) = self.flush(&mut file).await {
                log::error!("could not publish final broker message: {}", e);
            }
        }
    }

    async fn flush(&self, file: &mut BrokerFile) -> Result<(), PluginError> {
        self.producer
            .send(&self.topic, &file.id, file.buffer.clone())
            .await?;
        file.sent += file.buffer.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MockProducer {
        messages: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    impl MessageProducer for MockProducer {
        fn send(
            &self,
            _topic: &str,
            key: &str,
            payload: Vec<u8>,
        ) -> impl Future<Output = Result<(), PluginError>> + Send {
            self.messages
                .lock()
                .unwrap()
                .push((key.to_string(), payload));
            async { Ok(()) }
        }
    }

    fn plugin(producer: MockProducer, message_size: usize, file_size: u64) -> KafkaPlugin<MockProducer> {
        let config = KafkaPluginConfig {
            brokers: vec!["broker:9092".to_string()],
            topic: "packets".to_string(),
            message_size,
            file_size,
        };
        KafkaPlugin::new(producer, &config)
    }

    async fn publish(plugin: KafkaPlugin<MockProducer>, pkts: Vec<&[u8]>) {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(plugin.run(rx, CancellationToken::new()));
        for pkt in pkts {
            tx.send(pkt.to_vec()).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_long_record_is_chunked_to_message_size() {
        let producer = MockProducer::default();
        let messages = Arc::clone(&producer.messages);
        publish(plugin(producer, 8, 1_000_000), vec![b"regular message"]).await;

        let messages = messages.lock().unwrap();
        let bodies: Vec<&[u8]> = messages.iter().map(|(_, body)| body.as_slice()).collect();
        assert_eq!(
            bodies,
            vec![
                b"\xde\xef\xec\xe0regu".as_slice(),
                b"lar mess".as_slice(),
                b"age".as_slice(),
            ]
        );
        // All chunks of one file share the same key.
        assert!(messages.iter().all(|(key, _)| key == &messages[0].0));
    }

    #[tokio::test]
    async fn test_short_record_is_published_on_close() {
        let producer = MockProducer::default();
        let messages = Arc::clone(&producer.messages);
        publish(plugin(producer, 100, 1_000_000), vec![b"short"]).await;

        let messages = messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1, b"\xde\xef\xec\xe0short".to_vec());
    }

    #[tokio::test]
    async fn test_file_rotation_changes_the_key_and_restores_the_header() {
        let producer = MockProducer::default();
        let messages = Arc::clone(&producer.messages);
        // Each 8-byte message maxes out the file, forcing a rotation.
        publish(plugin(producer, 8, 8), vec![b"aaaabbbb", b"ccccdddd"]).await;

        let messages = messages.lock().unwrap();
        assert!(messages.len() >= 2);
        assert_ne!(messages[0].0, messages.last().unwrap().0);
        assert_eq!(&messages[0].1[..4], &[0xde, 0xef, 0xec, 0xe0]);
        // The rotated file starts with the header again.
        assert_eq!(&messages[1].1[..4], &[0xde, 0xef, 0xec, 0xe0]);
    }

    #[tokio::test]
    async fn test_header_only_buffer_is_not_published() {
        let producer = MockProducer::default();
        let messages = Arc::clone(&producer.messages);
        publish(plugin(producer, 100, 1_000_000), vec![]).await;
        assert!(messages.lock().unwrap().is_empty());
    }
}
