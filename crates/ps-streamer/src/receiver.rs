//! Receiver pipeline orchestration.
//!
//! transport → deframe → decompress → sinks and plugin fan-out. Each
//! accepted connection gets its own reader and decompress task; a protocol
//! violation takes that connection down without touching the others.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ps_config::Config;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::auth::CredentialVerifier;
use crate::compress;
use crate::output::Outputs;
use crate::stats::{self, Stats};
use crate::transport::Transport;
use crate::{frame, tls, StreamError};

const STAGE_QUEUE_LEN: usize = 100;
const SINK_QUEUE_LEN: usize = 1_000;

/// Run the receiver until the stop token fires.
pub async fn run<V>(
    config: Arc<Config>,
    verifier: Arc<V>,
    plugin_tx: Option<mpsc::Sender<Vec<u8>>>,
    stop: CancellationToken,
) -> Result<(), StreamError>
where
    V: CredentialVerifier + 'static,
{
    let input = config.input.as_ref().ok_or(StreamError::NoInput)?;
    let port = input.port.ok_or(StreamError::NoInput)?;
    let addr = format!("{}:{}", input.address, port);

    let acceptor = if config.tls.enable {
        Some(TlsAcceptor::from(tls::server_config(
            &config.tls.cert_file,
            &config.tls.key_file,
        )?))
    } else {
        None
    };

    let listener = TcpListener::bind(&addr).await?;
    log::info!("Listening on {}", addr);

    let stats = Arc::new(Stats::default());
    tokio::spawn(stats::data_size_loop(Arc::clone(&stats), stop.child_token()));

    let (size_tx, mut size_rx) = mpsc::channel::<usize>(STAGE_QUEUE_LEN);
    let size_stats = Arc::clone(&stats);
    tokio::spawn(async move {
        while let Some(size) = size_rx.recv().await {
            size_stats.total_bytes.fetch_add(size as u64, Ordering::Relaxed);
        }
    });

    let outputs = Outputs::new(&config).await?;
    let (sink_tx, sink_rx) = mpsc::channel::<Vec<u8>>(SINK_QUEUE_LEN);
    let sink_handle = tokio::spawn(sink_loop(outputs, sink_rx, plugin_tx, stop.clone()));

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    log::info!("Accepted connection on socket: {}", peer);
                    tokio::spawn(handle_connection(
                        tcp,
                        peer.to_string(),
                        acceptor.clone(),
                        Arc::clone(&config),
                        Arc::clone(&verifier),
                        sink_tx.clone(),
                        size_tx.clone(),
                        stop.child_token(),
                    ));
                }
                Err(e) => {
                    log::error!("Unable to accept connections on socket: {}", e);
                    break;
                }
            },
        }
    }

    stop.cancel();
    drop(sink_tx);
    match sink_handle.await {
        Ok(result) => result,
        Err(e) => Err(StreamError::Io(std::io::Error::other(e))),
    }
}

/// Drain decompressed batches into the configured sinks and the plugin
/// fan-out, then flush-and-close everything on shutdown.
async fn sink_loop(
    mut outputs: Outputs,
    mut sink_rx: mpsc::Receiver<Vec<u8>>,
    plugin_tx: Option<mpsc::Sender<Vec<u8>>>,
    stop: CancellationToken,
) -> Result<(), StreamError> {
    let mut result = Ok(());

    loop {
        let data = tokio::select! {
            _ = stop.cancelled() => break,
            data = sink_rx.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        if let Some(plugin_tx) = &plugin_tx {
            if let Err(TrySendError::Full(_)) = plugin_tx.try_send(data.clone()) {
                log::warn!("Plugin queue is full. Discarding");
            }
        }
        if let Err(e) = outputs.write_all(&data).await {
            log::error!("No sinks left: {}", e);
            stop.cancel();
            result = Err(e);
            break;
        }
    }

    outputs.flush_and_close().await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection<V>(
    tcp: TcpStream,
    peer: String,
    acceptor: Option<TlsAcceptor>,
    config: Arc<Config>,
    verifier: Arc<V>,
    sink_tx: mpsc::Sender<Vec<u8>>,
    size_tx: mpsc::Sender<usize>,
    stop: CancellationToken,
) where
    V: CredentialVerifier + 'static,
{
    let mut transport = match acceptor {
        Some(acceptor) => match acceptor.accept(tcp).await {
            Ok(stream) => Transport::TlsServer(Box::new(stream)),
            Err(e) => {
                log::warn!("TLS handshake failed for {}: {}", peer, e);
                return;
            }
        },
        None => Transport::Plain(tcp),
    };

    if config.auth.enable {
        match crate::auth::server_handshake(&mut transport, verifier.as_ref()).await {
            Ok(identity) => log::info!("Authenticated client {} as {}", peer, identity),
            Err(e) => {
                log::warn!("Authentication failed for {}: {}", peer, e);
                return;
            }
        }
    }

    let (decompress_tx, decompress_rx) = mpsc::channel(STAGE_QUEUE_LEN);
    let decompressor = tokio::spawn(compress::decompress_stage(
        decompress_rx,
        sink_tx,
        stop.clone(),
    ));

    let max_encoded_len = frame::max_encoded_len(config.max_gather_len());
    loop {
        let block = tokio::select! {
            _ = stop.cancelled() => break,
            block = frame::read_frame(&mut transport, max_encoded_len) => block,
        };
        match block {
            Ok(block) => {
                let frame_len = frame::HEADER_LEN + block.data.len();
                match decompress_tx.try_send(block) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::warn!("Uncompress queue is full. Discarding");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
                if let Err(TrySendError::Full(_)) = size_tx.try_send(frame_len) {
                    log::warn!("Size queue is full. Discarding");
                }
            }
            // An idle peer timing out is not worth a log line.
            Err(StreamError::Timeout) => break,
            Err(e) => {
                log::warn!("Unable to read data from connection {}: {}", peer, e);
                break;
            }
        }
    }

    // Closing the decompress queue drains and terminates the stage.
    drop(decompress_tx);
    let _ = decompressor.await;
    log::debug!("Connection handler for {} finished", peer);
}
