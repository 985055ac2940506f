use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rusty_duct::{AcceptedConn, ConnHandler};
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio_util::task::TaskTracker;
use tokio_util::time::FutureExt;
use tracing::{debug, trace, warn};

use crate::config::settings::ForwardSettings;

/// Relays every accepted connection to the configured TCP backend. Lives on
/// the far side of a channel so the listener's accept loop never waits on
/// backend I/O.
pub(crate) struct Forwarder {
    conn_receiver: Receiver<AcceptedConn>,
    destination: SocketAddr,
    connect_timeout: Duration,
    tasks: TaskTracker,
}

impl Forwarder {
    pub(crate) fn new(settings: &ForwardSettings) -> (Self, Sender<AcceptedConn>) {
        let (conn_sender, conn_receiver) = channel(settings.queue);
        let forwarder = Self {
            conn_receiver,
            destination: settings.destination,
            connect_timeout: settings.connect_timeout,
            tasks: TaskTracker::new(),
        };
        (forwarder, conn_sender)
    }

    /// The handler given to the listener. Queues and returns; when the queue
    /// is full the connection is shed rather than stalling the accept loop.
    pub(crate) fn handler(conn_sender: Sender<AcceptedConn>) -> Arc<dyn ConnHandler> {
        Arc::new(move |conn: AcceptedConn| {
            if let Err(e) = conn_sender.try_send(conn) {
                warn!("shedding connection, forward queue unavailable: {}", e);
            }
        })
    }

    /// Runs until every handler clone is gone, then drains in-flight relays.
    pub(crate) async fn run(mut self) {
        while let Some(conn) = self.conn_receiver.recv().await {
            self.tasks.spawn(relay(conn, self.destination, self.connect_timeout));
        }
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn relay(mut conn: AcceptedConn, destination: SocketAddr, connect_timeout: Duration) {
    trace!("relaying {} to backend {}", conn.peer, destination);
    let Ok(connect_result) = TcpStream::connect(destination).timeout(connect_timeout).await else {
        debug!("timed out connecting to backend {}", destination);
        return;
    };
    let Ok(mut backend) = connect_result else {
        debug!("failed to connect to backend {}", destination);
        return;
    };
    match copy_bidirectional(&mut conn.stream, &mut backend).await {
        Ok((up, down)) => trace!(
            "connection from {} finished, {} bytes up, {} bytes down",
            conn.peer, up, down
        ),
        Err(e) => debug!("connection from {} broke: {}", conn.peer, e),
    }
}

#[cfg(test)]
mod tests {
    use rusty_duct::PeerAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn relays_bytes_to_the_backend() {
        let backend = TcpListener::bind("127.0.0.1:0").await.expect("backend bind");
        let destination = backend.local_addr().expect("backend addr");
        tokio::task::spawn(async move {
            let (mut stream, _) = backend.accept().await.expect("backend accept");
            let mut request = [0u8; 4];
            stream.read_exact(&mut request).await.expect("backend read");
            assert_eq!(&request, b"ping");
            stream.write_all(b"pong").await.expect("backend write");
        });

        let settings = ForwardSettings {
            destination,
            connect_timeout: Duration::from_secs(5),
            queue: 8,
        };
        let (forwarder, conn_sender) = Forwarder::new(&settings);
        let run_task = tokio::task::spawn(forwarder.run());

        let (mut client_io, server_io) = tokio::io::duplex(512);
        let handler = Forwarder::handler(conn_sender);
        handler.handle(AcceptedConn {
            stream: Box::new(server_io),
            peer: PeerAddr::Unix(None),
        });
        drop(handler);

        client_io.write_all(b"ping").await.expect("client write");
        let mut reply = [0u8; 4];
        client_io.read_exact(&mut reply).await.expect("client read");
        assert_eq!(&reply, b"pong");
        // Hang up so the relay sees EOF and the forwarder can drain
        drop(client_io);

        run_task.await.expect("forwarder drains");
    }
}
