use std::{fmt::Display, io, sync::Arc};

use common::{
    relay::{copy_bidirectional_with, is_early_close},
    Destination, Dispatcher, Timeouts,
};
use log::{debug, error, info};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};

/// Forwards every accepted connection to one configured destination.
pub struct DokodemoServer {
    destination: Destination,
    dispatcher: Arc<dyn Dispatcher>,
    timeouts: Timeouts,
}

impl DokodemoServer {
    pub fn new(destination: Destination, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            destination,
            dispatcher,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(
            "Serving dokodemo-door on {} towards {}",
            listener.local_addr()?,
            self.destination
        );
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            debug!("Accepted connection from {}", peer_addr);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                    error!("Error handling client {}: {}", peer_addr, e);
                }
            });
        }
    }

    pub async fn handle_connection<S, P>(&self, stream: S, peer: P) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
        P: Display,
    {
        let ray = self.dispatcher.dispatch_to_outbound(self.destination.clone());
        let (input, output) = ray.into_parts();
        match copy_bidirectional_with(stream, input, output, self.timeouts).await {
            Ok((up, down)) => {
                debug!("{} closed, {} bytes up, {} bytes down", peer, up, down);
                Ok(())
            }
            Err(e) if is_early_close(&e) => {
                debug!("{} closed early: {}", peer, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
