use std::{fmt::Display, io, sync::Arc};

use common::{
    relay::relay, ActivityTimer, Dispatcher, Timeouts,
};
use log::{debug, error, info, trace, warn};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    aead::{open_header, response_keys, seal_response_header},
    auth_id::AUTH_ID_LEN,
    drain::Drainer,
    error::Error,
    protocol::{option, RequestHeader, ResponseHeader},
    stream::{copy_chunks_to_pipe, copy_pipe_to_chunks, ChunkReader, ChunkWriter, Framing},
    user::User,
    validator::Validator,
};

/// Accepts VMess clients and hands their requests to the dispatcher.
pub struct VmessServer {
    validator: Arc<Validator<User>>,
    dispatcher: Arc<dyn Dispatcher>,
    timeouts: Timeouts,
}

impl VmessServer {
    pub fn new(validator: Arc<Validator<User>>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            validator,
            dispatcher,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!("Serving vmess on {}", listener.local_addr()?);
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            debug!("Accepted vmess connection from {}", peer_addr);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_tcp_client(stream, peer_addr).await {
                    error!("Error handling vmess client {}: {}", peer_addr, e);
                }
            });
        }
    }

    pub async fn handle_tcp_client<P>(&self, stream: TcpStream, peer: P) -> io::Result<()>
    where
        P: Display,
    {
        stream.set_nodelay(true)?;
        self.handle_connection(stream, peer).await
    }

    /// Runs one connection to completion.
    ///
    /// A client that fails authentication is drained before the error is
    /// returned, so the connection is never closed right at the point where
    /// validation failed.
    pub async fn handle_connection<S, P>(&self, mut stream: S, peer: P) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        P: Display,
    {
        let mut drainer = Drainer::new(self.validator.behavior_seed());

        let mut auth_id = [0u8; AUTH_ID_LEN];
        stream.read_exact(&mut auth_id).await?;
        drainer.acknowledge_receive(AUTH_ID_LEN);

        let user = match self.validator.match_auth_id(&auth_id) {
            Ok(user) => user,
            Err(e) => {
                match e {
                    Error::Replay => warn!("{} replayed an auth id", peer),
                    _ => debug!("{} sent an unknown auth id", peer),
                }
                drainer.drain(&mut stream).await?;
                return Err(e.into());
            }
        };
        trace!("{} authenticated as {}", peer, user.name());

        let opened = match open_header(user.cmd_key(), &auth_id, &mut stream).await {
            Ok(opened) => opened,
            Err(e) => {
                drainer.acknowledge_receive(e.consumed);
                if e.drain {
                    drainer.drain(&mut stream).await?;
                }
                return Err(e.error.into());
            }
        };
        drainer.acknowledge_receive(opened.consumed);

        let request = RequestHeader::decode(&opened.payload)?;
        if request.option & option::CHUNK_STREAM == 0 {
            return Err(Error::Unsupported("stream without chunks".to_owned()).into());
        }

        let destination = request.destination();
        info!("{} [{}] requested {}", peer, user.name(), destination);
        let ray = self.dispatcher.dispatch_to_outbound(destination);

        let (resp_key, resp_iv) = response_keys(&request.body_key, &request.body_iv);
        let response = ResponseHeader {
            response_auth: request.response_auth,
            option: 0,
        };
        let sealed = seal_response_header(&resp_key, &resp_iv, &response.encode())?;
        stream.write_all(&sealed).await?;

        let framing = Framing::new(request.option, request.security);
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = ChunkReader::new(
            reader,
            request.security,
            framing,
            &request.body_key,
            &request.body_iv,
        );
        let mut writer = ChunkWriter::new(writer, request.security, framing, &resp_key, &resp_iv);
        let (mut input, mut output) = ray.into_parts();

        let timer = ActivityTimer::new(self.timeouts.idle);
        let result = relay(
            &timer,
            self.timeouts,
            copy_chunks_to_pipe(&mut reader, &mut input, &timer),
            copy_pipe_to_chunks(&mut output, &mut writer, &timer),
        )
        .await;
        let (uploaded, downloaded) = match result {
            Ok(totals) => totals,
            Err(e) => {
                input.release();
                output.release();
                return Err(e);
            }
        };
        debug!(
            "{} finished, {} bytes up, {} bytes down",
            peer, uploaded, downloaded
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use common::{Address, Destination, InboundRay, OutboundRay, PipeState};
    use tokio::{io::duplex, sync::mpsc, time::timeout};
    use uuid::Uuid;

    use super::*;
    use crate::{aead::seal_header, protocol::Security};

    struct Unreachable;

    impl Dispatcher for Unreachable {
        fn dispatch_to_outbound(&self, destination: common::Destination) -> InboundRay {
            panic!("unexpected dispatch to {}", destination);
        }
    }

    struct Capture {
        tx: mpsc::UnboundedSender<OutboundRay>,
    }

    impl Dispatcher for Capture {
        fn dispatch_to_outbound(&self, _destination: Destination) -> InboundRay {
            let (inbound, outbound) = common::ray(4);
            let _ = self.tx.send(outbound);
            inbound
        }
    }

    fn server() -> (User, VmessServer) {
        let user = User::new(Uuid::new_v4(), 0, Some("test@example.com".to_owned()));
        let validator = Arc::new(Validator::new());
        validator.add_account(user.clone());
        (user, VmessServer::new(validator, Arc::new(Unreachable)))
    }

    #[tokio::test]
    async fn unknown_user_is_drained_then_rejected() {
        let (_user, server) = server();
        let (mut client, server_side) = duplex(1 << 16);

        let stranger = User::new(Uuid::new_v4(), 0, None);
        let sealed = seal_header(stranger.cmd_key(), b"whatever").unwrap();
        client.write_all(&sealed[..AUTH_ID_LEN]).await.unwrap();

        // the server keeps reading past the auth id before giving up
        let handle =
            tokio::spawn(async move { server.handle_connection(server_side, "peer").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        client.write_all(&[0u8; 4096]).await.unwrap();
        let err = timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(Error::from_io(&err), Some(Error::NotFound)));
    }

    #[tokio::test]
    async fn tampered_header_is_rejected() {
        let (user, server) = server();
        let (mut client, server_side) = duplex(1 << 16);

        let mut sealed = seal_header(user.cmd_key(), b"not a request").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        client.write_all(&sealed).await.unwrap();
        drop(client);

        let err = server.handle_connection(server_side, "peer").await.unwrap_err();
        assert!(matches!(Error::from_io(&err), Some(Error::OpenPayload)));
    }

    #[tokio::test]
    async fn garbage_request_is_invalid_data() {
        let (user, server) = server();
        let (mut client, server_side) = duplex(1 << 16);

        let sealed = seal_header(user.cmd_key(), b"not a request").unwrap();
        client.write_all(&sealed).await.unwrap();

        let err = server.handle_connection(server_side, "peer").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn silent_outbound_is_released_after_upload_ends() {
        let user = User::new(Uuid::new_v4(), 0, None);
        let validator = Arc::new(Validator::new());
        validator.add_account(user.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = VmessServer::new(validator, Arc::new(Capture { tx })).with_timeouts(Timeouts {
            idle: Duration::from_secs(30),
            uplink_only: Duration::from_millis(200),
            downlink_only: Duration::from_millis(200),
        });

        let (mut client, server_side) = duplex(1 << 16);
        let serving =
            tokio::spawn(async move { server.handle_connection(server_side, "peer").await });

        let destination = Destination::tcp(Address::DomainName("example.com".to_owned(), 80));
        let request = RequestHeader::new(&destination, Security::Aes128Gcm);
        let sealed = seal_header(user.cmd_key(), &request.encode().unwrap()).unwrap();
        client.write_all(&sealed).await.unwrap();
        let framing = Framing::new(request.option, request.security);
        let mut writer = ChunkWriter::new(
            client,
            request.security,
            framing,
            &request.body_key,
            &request.body_iv,
        );
        writer.write_chunk(b"req").await.unwrap();
        writer.finish().await.unwrap();

        // the outbound takes the request and never answers
        let outbound = rx.recv().await.unwrap();
        let (mut input, output) = outbound.into_parts();
        assert_eq!(input.read().await.unwrap(), Some(Bytes::from("req")));
        assert_eq!(input.read().await.unwrap(), None);

        let err = timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(output.state(), PipeState::Released);
    }
}
