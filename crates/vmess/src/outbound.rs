use std::io;

use async_trait::async_trait;
use common::{
    relay::relay, ActivityTimer, Address, Destination, OutboundHandler, OutboundRay, PipeWriter,
    Timeouts,
};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
    aead::{open_response_header, response_keys, seal_header},
    error::Error,
    protocol::{RequestHeader, ResponseHeader, Security},
    stream::{copy_chunks_to_pipe, copy_pipe_to_chunks, ChunkReader, ChunkWriter, Framing},
    user::ID,
};

/// Tunnels connections through a remote VMess server.
pub struct VmessClient {
    server: Address,
    id: ID,
    security: Security,
    timeouts: Timeouts,
}

impl VmessClient {
    pub fn new(server: Address, id: ID, security: Security) -> Self {
        Self {
            server,
            id,
            security,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Speaks VMess over an already connected `stream` on behalf of `ray`.
    pub async fn handle_stream<S>(
        &self,
        mut stream: S,
        destination: Destination,
        ray: OutboundRay,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let request = RequestHeader::new(&destination, self.security);
        let sealed = seal_header(&self.id.cmd_key, &request.encode()?)?;
        stream.write_all(&sealed).await?;
        trace!("sent {} byte request header for {}", sealed.len(), destination);

        let (resp_key, resp_iv) = response_keys(&request.body_key, &request.body_iv);
        let framing = Framing::new(request.option, request.security);
        let (reader, writer) = tokio::io::split(stream);
        let mut writer = ChunkWriter::new(
            writer,
            self.security,
            framing,
            &request.body_key,
            &request.body_iv,
        );
        let (mut input, mut output) = ray.into_parts();

        let timer = ActivityTimer::new(self.timeouts.idle);
        let upload = copy_pipe_to_chunks(&mut input, &mut writer, &timer);
        let download = self.download(
            reader,
            &request,
            framing,
            (&resp_key, &resp_iv),
            &mut output,
            &timer,
        );

        let result = relay(&timer, self.timeouts, upload, download).await;
        let (uploaded, downloaded) = match result {
            Ok(totals) => totals,
            Err(e) => {
                input.release();
                output.release();
                return Err(e);
            }
        };
        debug!(
            "vmess to {} finished, {} bytes up, {} bytes down",
            destination, uploaded, downloaded
        );
        Ok(())
    }

    /// Checks the response header, then forwards the reply chunks.
    async fn download<R>(
        &self,
        mut reader: R,
        request: &RequestHeader,
        framing: Framing,
        (resp_key, resp_iv): (&[u8; 16], &[u8; 16]),
        output: &mut PipeWriter,
        timer: &ActivityTimer,
    ) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let header = match open_response_header(resp_key, resp_iv, &mut reader).await {
            Ok(header) => header,
            Err(e) => {
                output.release();
                return Err(e.into());
            }
        };
        let response = ResponseHeader::decode(&header)?;
        if response.response_auth != request.response_auth {
            output.release();
            return Err(Error::ResponseAuth.into());
        }
        let mut reader = ChunkReader::new(reader, self.security, framing, resp_key, resp_iv);
        copy_chunks_to_pipe(&mut reader, output, timer).await
    }
}

#[async_trait]
impl OutboundHandler for VmessClient {
    async fn handle(&self, destination: Destination, ray: OutboundRay) -> io::Result<()> {
        debug!("connecting to vmess server {} for {}", self.server, destination);
        let stream = self.server.connect_tcp().await?;
        stream.set_nodelay(true)?;
        self.handle_stream(stream, destination, ray).await
    }
}
