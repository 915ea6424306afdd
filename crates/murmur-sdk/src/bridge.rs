// Copyright 2025 The murmur-sdk Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The external automation surface, used for cross-process testing.
//!
//! A driver process issues line-delimited JSON commands on stdin and reads
//! line-delimited JSON responses on stdout. The bridge itself is protocol
//! plumbing only; the operations are provided by a [`BridgeHandler`]
//! implemented on top of the engine and the transport's invite
//! primitives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::identifiers::{IdentityKey, RumorId};

/// A command from the driving process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum BridgeCommand {
    GetPubkey,
    CreateInvite,
    AcceptInvite { invite: String },
    WaitForSession { peer: IdentityKey },
    SendMessage { peer: IdentityKey, text: String },
    WaitForMessage,
    Shutdown,
}

/// A response or readiness event sent back to the driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeResponse {
    /// Emitted once at startup, before any command is read.
    Ready,
    Pubkey { pubkey: IdentityKey },
    Invite { invite: String },
    InviteAccepted,
    SessionEstablished { peer: IdentityKey },
    MessageSent { rumor_id: Option<RumorId> },
    Message { sender: IdentityKey, text: String },
    ShuttingDown,
    Error { message: String },
}

/// The operations behind the bridge commands.
#[async_trait]
pub trait BridgeHandler: Send + Sync {
    async fn pubkey(&self) -> IdentityKey;

    async fn create_invite(&self) -> crate::Result<String>;

    async fn accept_invite(&self, invite: &str) -> crate::Result<()>;

    /// Resolve once a cryptographic session with `peer` is established.
    async fn wait_for_session(&self, peer: &IdentityKey) -> crate::Result<()>;

    async fn send_message(&self, peer: &IdentityKey, text: &str)
    -> crate::Result<Option<RumorId>>;

    /// Resolve with the next inbound chat message.
    async fn wait_for_message(&self) -> crate::Result<(IdentityKey, String)>;
}

/// Execute a single command. Returns the response and whether the bridge
/// should shut down afterwards.
pub async fn dispatch(
    handler: &dyn BridgeHandler,
    command: BridgeCommand,
) -> (BridgeResponse, bool) {
    let response = match command {
        BridgeCommand::GetPubkey => BridgeResponse::Pubkey { pubkey: handler.pubkey().await },

        BridgeCommand::CreateInvite => match handler.create_invite().await {
            Ok(invite) => BridgeResponse::Invite { invite },
            Err(err) => BridgeResponse::Error { message: err.to_string() },
        },

        BridgeCommand::AcceptInvite { invite } => match handler.accept_invite(&invite).await {
            Ok(()) => BridgeResponse::InviteAccepted,
            Err(err) => BridgeResponse::Error { message: err.to_string() },
        },

        BridgeCommand::WaitForSession { peer } => match handler.wait_for_session(&peer).await {
            Ok(()) => BridgeResponse::SessionEstablished { peer },
            Err(err) => BridgeResponse::Error { message: err.to_string() },
        },

        BridgeCommand::SendMessage { peer, text } => {
            match handler.send_message(&peer, &text).await {
                Ok(rumor_id) => BridgeResponse::MessageSent { rumor_id },
                Err(err) => BridgeResponse::Error { message: err.to_string() },
            }
        }

        BridgeCommand::WaitForMessage => match handler.wait_for_message().await {
            Ok((sender, text)) => BridgeResponse::Message { sender, text },
            Err(err) => BridgeResponse::Error { message: err.to_string() },
        },

        BridgeCommand::Shutdown => return (BridgeResponse::ShuttingDown, true),
    };

    (response, false)
}

/// Serve the bridge protocol over the given byte streams until the driver
/// sends `shutdown` or closes its end.
pub async fn serve(
    handler: &dyn BridgeHandler,
    reader: impl AsyncBufRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
) -> std::io::Result<()> {
    let mut lines = reader.lines();

    write_line(&mut writer, &BridgeResponse::Ready).await?;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let command: BridgeCommand = match serde_json::from_str(&line) {
            Ok(command) => command,
            Err(err) => {
                warn!("unparseable bridge command: {err}");
                write_line(&mut writer, &BridgeResponse::Error { message: err.to_string() })
                    .await?;
                continue;
            }
        };

        let (response, shutdown) = dispatch(handler, command).await;
        write_line(&mut writer, &response).await?;

        if shutdown {
            debug!("bridge driver requested shutdown");
            break;
        }
    }

    Ok(())
}

async fn write_line(
    writer: &mut (impl AsyncWrite + Unpin),
    response: &BridgeResponse,
) -> std::io::Result<()> {
    // Responses are small; an allocation per line is fine here.
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
