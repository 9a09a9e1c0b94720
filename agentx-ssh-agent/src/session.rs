//! Per-connection agent protocol loop.
//!
//! Messages are `uint32` length-prefixed.  Extension requests are answered
//! the way the reference agent does it: a non-empty handler result is the
//! whole reply body, an empty one is `SSH_AGENT_SUCCESS`, an unknown name is
//! `SSH_AGENT_FAILURE` and any other handler error is
//! `SSH_AGENT_EXTENSION_FAILURE`.  Everything else is decoded and encoded by
//! `ssh_agent_lib`.

use std::io;

use ssh_agent_lib::agent::Session as _;
use ssh_agent_lib::proto::{Request, Response};
use ssh_encoding::{Decode as _, Encode as _};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tracing::{debug, warn};

use crate::extension::ExtensionError;
use crate::service::AgentService;

/// Largest request accepted, matching the reference agent.
pub const MAX_MESSAGE_LEN: usize = 16 << 20;

pub const SSH_AGENT_FAILURE: u8 = 5;
pub const SSH_AGENT_SUCCESS: u8 = 6;
pub const SSH_AGENTC_EXTENSION: u8 = 27;
pub const SSH_AGENT_EXTENSION_FAILURE: u8 = 28;

/// Serve one client until it disconnects.
pub async fn serve_connection<S>(mut stream: S, mut service: AgentService) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut len = [0u8; 4];
        match stream.read_exact(&mut len).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("agent client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("agent request of {len} bytes exceeds {MAX_MESSAGE_LEN}"),
            ));
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;

        let reply = dispatch(&mut service, &body).await;

        let reply_len = u32::try_from(reply.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "agent reply too large"))?;
        stream.write_all(&reply_len.to_be_bytes()).await?;
        stream.write_all(&reply).await?;
        stream.flush().await?;
    }
}

/// Answer one request body with one reply body.
pub async fn dispatch(service: &mut AgentService, body: &[u8]) -> Vec<u8> {
    let Some(&kind) = body.first() else {
        return vec![SSH_AGENT_FAILURE];
    };

    if kind == SSH_AGENTC_EXTENSION {
        let Some((name, payload)) = parse_extension(&body[1..]) else {
            warn!("malformed extension request");
            return vec![SSH_AGENT_FAILURE];
        };
        return extension_reply(&name, service.handle_extension(name.clone(), payload).await);
    }

    let request = match Request::decode(&mut &body[..]) {
        Ok(request) => request,
        Err(e) => {
            debug!(kind, error = %e, "undecodable agent request");
            return vec![SSH_AGENT_FAILURE];
        }
    };
    let response = match service.handle(request).await {
        Ok(response) => response,
        Err(e) => {
            debug!(kind, error = %e, "agent request failed");
            Response::Failure
        }
    };
    let mut out = Vec::new();
    match response.encode(&mut out) {
        Ok(()) => out,
        Err(e) => {
            warn!(kind, error = %e, "could not encode agent response");
            vec![SSH_AGENT_FAILURE]
        }
    }
}

/// `string name` followed by the raw payload.
fn parse_extension(mut body: &[u8]) -> Option<(String, Vec<u8>)> {
    let name = String::decode(&mut body).ok()?;
    Some((name, body.to_vec()))
}

fn extension_reply(name: &str, result: Result<Vec<u8>, ExtensionError>) -> Vec<u8> {
    match result {
        Ok(body) if body.is_empty() => vec![SSH_AGENT_SUCCESS],
        Ok(body) => body,
        Err(ExtensionError::Unsupported(_)) => {
            debug!(extension = name, "unsupported extension");
            vec![SSH_AGENT_FAILURE]
        }
        Err(e) => {
            warn!(extension = name, error = %e, "extension failed");
            vec![SSH_AGENT_EXTENSION_FAILURE]
        }
    }
}
