/*
 * This file is part of YogaVPC.
 *
 * Copyright (C) 2026 YogaVPC contributors
 *
 * YogaVPC is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License version 2 as
 * published by the Free Software Foundation.
 *
 * YogaVPC is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with YogaVPC. If not, see <https://www.gnu.org/licenses/>.
 */

//! Daemon client
//!
//! One newline-delimited JSON request per call over the daemon's Unix socket.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use thiserror::Error;
use vpc_core::constants::{ipc::CLIENT_TIMEOUT, paths::DAEMON_SOCKET};
use vpc_protocol::{
    generate_request_id, DriverStatus, ErrorKind, PowerEvent, PropertyValue, Request,
    RequestEnvelope, Response, ResponseData, ResponseEnvelope, MAX_MESSAGE_SIZE,
};

/// Environment override for the daemon socket
pub const SOCKET_ENV: &str = "YOGAVPC_SOCKET";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon at {path}: {source}")]
    Connect { path: String, source: io::Error },

    #[error("I/O error talking to daemon: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Daemon closed connection")]
    Closed,

    #[error("Malformed response: {0}")]
    Protocol(String),

    #[error("Response ID mismatch: expected {expected}, got {got}")]
    IdMismatch { expected: u64, got: u64 },

    /// The daemon answered with an error
    #[error("{kind:?}: {message}")]
    Daemon { kind: ErrorKind, message: String },
}

/// Socket from the environment, falling back to the system default
pub fn socket_path() -> PathBuf {
    std::env::var_os(SOCKET_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DAEMON_SOCKET))
}

pub struct VpcClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl VpcClient {
    pub fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path)
            .map_err(|source| ClientError::Connect { path: path.display().to_string(), source })?;
        stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
        stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { writer: stream, reader })
    }

    /// Send one request and return its payload; daemon errors become `ClientError::Daemon`
    pub fn request(&mut self, request: Request) -> Result<ResponseData, ClientError> {
        request.validate().map_err(ClientError::InvalidRequest)?;

        let id = generate_request_id();
        let mut line = serde_json::to_vec(&RequestEnvelope::with_id(request, id))
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
        line.push(b'\n');
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ClientError::MessageTooLarge { size: line.len(), max_size: MAX_MESSAGE_SIZE });
        }
        self.writer.write_all(&line)?;

        let mut buf = Vec::with_capacity(1024);
        self.reader.read_until(b'\n', &mut buf)?;
        if buf.is_empty() {
            return Err(ClientError::Closed);
        }

        let envelope: ResponseEnvelope =
            serde_json::from_slice(&buf).map_err(|e| ClientError::Protocol(e.to_string()))?;
        if envelope.id != id {
            return Err(ClientError::IdMismatch { expected: id, got: envelope.id });
        }

        match envelope.response {
            Response::Ok(data) => Ok(data),
            Response::Error { kind, message } => Err(ClientError::Daemon { kind, message }),
        }
    }

    pub fn ping(&mut self) -> Result<String, ClientError> {
        let data = self.request(Request::Ping)?;
        data.value.ok_or_else(|| ClientError::Protocol("Ping without value".into()))
    }

    pub fn status(&mut self) -> Result<DriverStatus, ClientError> {
        let data = self.request(Request::Status)?;
        data.status.ok_or_else(|| ClientError::Protocol("Status without payload".into()))
    }

    pub fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<ResponseData, ClientError> {
        self.request(Request::SetProperty { name: name.to_string(), value })
    }

    pub fn power(&mut self, event: PowerEvent) -> Result<ResponseData, ClientError> {
        self.request(Request::Power { event })
    }
}
