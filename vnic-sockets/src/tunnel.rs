//! Connection spawning and the reverse-tunnel byte relay.
//!
//! A spawn opens a real TCP connection from the device back to the client's
//! callback address.  The attempt runs in its own task so the control channel
//! never waits on it; the outcome is delivered to the owning control task as a
//! single [`ControlEvent::Spawned`] or [`ControlEvent::SpawnFailed`].
//!
//! Once established the tunnel is a plain relay:
//!
//! ```text
//!   client ──TCP bytes──▶ tunnel ──VirtualDevice::write(flow)──▶ device
//!   client ◀─TCP bytes─── tunnel ◀──TunnelHandle::write──────── device
//! ```
//!
//! When the TCP connection ends, or the device shuts the handle down, the
//! tunnel reports [`ControlEvent::TunnelClosed`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

use crate::control::ControlEvent;
use crate::device::VirtualDevice;
use crate::flow::FlowKey;

#[derive(Debug)]
pub(crate) enum TunnelCommand {
    Write(Vec<u8>),
    Shutdown,
}

/// The device's grip on one reverse tunnel.
///
/// Dropping every clone of the handle also ends the tunnel.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    flow: FlowKey,
    commands: UnboundedSender<TunnelCommand>,
}

impl TunnelHandle {
    pub(crate) fn new(flow: FlowKey, commands: UnboundedSender<TunnelCommand>) -> Self {
        Self { flow, commands }
    }

    /// A handle with no relay task behind it.
    #[cfg(test)]
    pub(crate) fn detached(flow: FlowKey) -> (Self, UnboundedReceiver<TunnelCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(flow, tx), rx)
    }

    pub fn flow(&self) -> &FlowKey {
        &self.flow
    }

    /// Queue bytes for the client.  `false` once the tunnel has ended.
    pub fn write(&self, data: &[u8]) -> bool {
        self.commands
            .send(TunnelCommand::Write(data.to_vec()))
            .is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(TunnelCommand::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Where and how to open one reverse connection.
pub(crate) struct SpawnRequest {
    pub flow: FlowKey,
    pub callback_address: String,
    pub callback_port: u16,
    pub connect_timeout: Duration,
    pub read_chunk: usize,
}

/// Start the reverse connection for `request.flow` in the background.
pub(crate) fn spawn_reverse(
    request: SpawnRequest,
    device: Arc<dyn VirtualDevice>,
    events: UnboundedSender<ControlEvent>,
) {
    tokio::spawn(async move {
        let SpawnRequest {
            flow,
            callback_address,
            callback_port,
            connect_timeout,
            read_chunk,
        } = request;

        let stream = match connect(&callback_address, callback_port, connect_timeout).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(
                    "[tunnel] spawn for {flow} to {callback_address}:{callback_port} failed: {error}"
                );
                let _ = events.send(ControlEvent::SpawnFailed { flow, error });
                return;
            }
        };

        let spawn_port = match stream.local_addr() {
            Ok(addr) => addr.port(),
            Err(error) => {
                let _ = events.send(ControlEvent::SpawnFailed { flow, error });
                return;
            }
        };
        debug!("[tunnel] {flow} connected back from local port {spawn_port}");

        let (tx, rx) = mpsc::unbounded_channel();
        let tunnel = TunnelHandle::new(flow.clone(), tx);
        if events
            .send(ControlEvent::Spawned {
                flow: flow.clone(),
                spawn_port,
                tunnel,
            })
            .is_err()
        {
            debug!("[tunnel] control channel for {flow} is gone; dropping tunnel");
            return;
        }

        if let Err(e) = relay(stream, &flow, rx, device.as_ref(), read_chunk).await {
            debug!("[tunnel] {flow} relay ended with error: {e}");
        }
        info!("[tunnel] {flow} closed");
        let _ = events.send(ControlEvent::TunnelClosed(flow));
    });
}

async fn connect(address: &str, port: u16, limit: Duration) -> io::Result<TcpStream> {
    match timeout(limit, TcpStream::connect((address, port))).await {
        Ok(result) => result,
        Err(_elapsed) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "reverse connection timed out",
        )),
    }
}

async fn relay(
    stream: TcpStream,
    flow: &FlowKey,
    mut commands: UnboundedReceiver<TunnelCommand>,
    device: &dyn VirtualDevice,
    read_chunk: usize,
) -> io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; read_chunk];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    debug!("[tunnel] {flow} peer closed");
                    return Ok(());
                }
                debug!("[tunnel] {flow} → device {n} bytes");
                device.write(flow, &buf[..n]);
            }
            command = commands.recv() => match command {
                Some(TunnelCommand::Write(data)) => {
                    writer.write_all(&data).await?;
                }
                Some(TunnelCommand::Shutdown) | None => {
                    debug!("[tunnel] {flow} shut down by device");
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
            },
        }
    }
}
