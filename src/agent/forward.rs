//! Agent forwarding loop
//!
//! Reads length-prefixed request frames from a socket, answers each with
//! [`SshAgent::handle`] and re-arms for the next frame until the peer sends
//! EOF. Used for `auth-agent@openssh.com` channels and for the in-memory
//! socket russh's `AgentClient` talks to during agent authentication.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::constraints::RequestOrigin;
use super::emulator::SshAgent;
use super::protocol::{frame, frame_len, MAX_FRAME_LEN};
use crate::ssh::{SshError, Stream};

impl SshAgent {
    /// Serve requests over `io` until EOF. Returns the number of requests answered.
    pub async fn serve<S>(&self, mut io: S, origin: RequestOrigin) -> Result<u64, SshError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut served = 0u64;
        loop {
            let mut header = [0u8; 4];
            match io.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    debug!("Agent peer for {} closed after {} request(s)", origin.host, served);
                    return Ok(served);
                }
                Err(e) => return Err(e.into()),
            }

            let len = frame_len(header)?;
            let mut body = vec![0u8; len];
            io.read_exact(&mut body).await?;

            let reply = self.handle(&body, &origin);
            io.write_all(&frame(&reply)).await?;
            io.flush().await?;
            served += 1;
        }
    }

    /// Serve an agent channel opened by the server.
    pub async fn serve_stream(&self, stream: Stream, origin: RequestOrigin) -> Result<u64, SshError> {
        let (near, far) = tokio::io::duplex(MAX_FRAME_LEN);
        let _done = stream.bridge(near)?;
        let result = self.serve(far, origin).await;
        if let Err(e) = &result {
            warn!("Agent channel {} failed: {}", stream.label(), e);
            stream.cancel();
        }
        result
    }

    /// An in-memory socket served by this agent on `spawner`.
    pub fn local_socket(&self, origin: RequestOrigin, spawner: &Handle) -> DuplexStream {
        let (client, server) = tokio::io::duplex(MAX_FRAME_LEN);
        let agent = self.clone();
        spawner.spawn(async move {
            if let Err(e) = agent.serve(server, origin).await {
                warn!("In-process agent socket failed: {}", e);
            }
        });
        client
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::agent::keys::{fixtures, AgentKey};
    use crate::agent::protocol::{AgentRequest, AgentResponse, SSH_AGENT_FAILURE};
    use crate::ssh::channel_io::mock::MockChannel;
    use crate::ssh::Side;

    async fn roundtrip<S>(io: &mut S, request: &[u8]) -> Bytes
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        io.write_all(&frame(request)).await.unwrap();
        let mut header = [0u8; 4];
        io.read_exact(&mut header).await.unwrap();
        let mut body = vec![0u8; frame_len(header).unwrap()];
        io.read_exact(&mut body).await.unwrap();
        Bytes::from(body)
    }

    #[tokio::test]
    async fn test_serve_rearms_until_eof() {
        let agent = SshAgent::new();
        agent
            .load_key(AgentKey::decode(fixtures::ED25519, None).unwrap(), "ed", vec![])
            .unwrap();

        let mut client = agent.local_socket(RequestOrigin::local("web"), &Handle::current());

        for _ in 0..2 {
            let reply = roundtrip(&mut client, &AgentRequest::RequestIdentities.encode()).await;
            assert!(matches!(
                AgentResponse::decode(&reply).unwrap(),
                AgentResponse::Identities(ids) if ids.len() == 1
            ));
        }
        let reply = roundtrip(&mut client, &[42]).await;
        assert_eq!(&reply[..], &[SSH_AGENT_FAILURE]);
    }

    #[tokio::test]
    async fn test_serve_stops_on_eof_and_rejects_bad_frames() {
        let agent = SshAgent::new();

        let (client, server) = tokio::io::duplex(1024);
        drop(client);
        assert_eq!(agent.serve(server, RequestOrigin::local("x")).await.unwrap(), 0);

        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&[0, 0, 0, 0]).await.unwrap();
        assert!(agent.serve(server, RequestOrigin::local("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_stream_answers_channel_requests() {
        let agent = SshAgent::new();
        let channel = MockChannel::new(1 << 20);
        let stream = Stream::new(channel.io(), "agent", Handle::current(), None);

        channel.push(Side::Stdout, &frame(&AgentRequest::RequestIdentities.encode()));
        channel.set_eof();

        let served = tokio::time::timeout(
            Duration::from_secs(2),
            agent.serve_stream(stream, RequestOrigin::forwarded("jump")),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(served, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Empty identities answer: type 12, count 0.
        assert_eq!(channel.written(), frame(&[12, 0, 0, 0, 0]).to_vec());
        assert_eq!(channel.eof_sent(), 1);
        assert_eq!(channel.close_calls(), 1);
    }
}
