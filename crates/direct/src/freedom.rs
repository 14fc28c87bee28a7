use std::io;

use async_trait::async_trait;
use common::{
    relay::{copy_from_pipe, copy_to_pipe, is_early_close, relay},
    ActivityTimer, Destination, Network, OutboundHandler, OutboundRay, Timeouts,
};
use log::{debug, warn};

/// Connects straight to the destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct Freedom;

#[async_trait]
impl OutboundHandler for Freedom {
    async fn handle(&self, destination: Destination, ray: OutboundRay) -> io::Result<()> {
        if destination.network != Network::Tcp {
            warn!("freedom does not carry {}", destination);
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported network for {}", destination),
            ));
        }

        let stream = destination.address.connect_tcp().await?;
        stream.set_nodelay(true)?;
        debug!("connected to {} from {}", destination, stream.local_addr()?);

        let (mut input, mut output) = ray.into_parts();
        let (mut reader, mut writer) = stream.into_split();
        let timeouts = Timeouts::default();
        let timer = ActivityTimer::new(timeouts.idle);
        let result = relay(
            &timer,
            timeouts,
            copy_from_pipe(&mut input, &mut writer, &timer),
            copy_to_pipe(&mut reader, &mut output, &timer),
        )
        .await;
        if result.is_err() {
            input.release();
            output.release();
        }

        match result {
            Ok((up, down)) => {
                debug!("{} closed, {} bytes up, {} bytes down", destination, up, down);
                Ok(())
            }
            Err(e) if is_early_close(&e) => {
                debug!("{} closed early: {}", destination, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
