// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::result;

use tonic::Status;

pub type Result<T> = result::Result<T, GcsError>;

/// The error kind drives retry and propagation policy: transient errors are
/// retried inside the operation that hit them and never cross a manager
/// boundary, everything else crosses boundaries as a typed result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network flake or a retryable backing-store error.
    Transient,
    /// The entity does not exist; callers expecting optionality get an
    /// empty result instead.
    NotFound,
    /// Bad argument or missing dependency; no mutation has occurred.
    Invalid,
    /// A bounded budget ran out (restarts, placement attempts); the entity
    /// moves to a terminal state with this as the recorded reason.
    Exhausted,
    /// Unrecoverable; the process should stop and be restarted by its
    /// supervisor, replaying from the backing store.
    Fatal,
}

#[derive(Debug)]
pub enum GcsError {
    Transient(String),
    NotFound(String),
    Invalid(String),
    Exhausted(String),
    Fatal(String),
}

impl GcsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GcsError::Transient(_) => ErrorKind::Transient,
            GcsError::NotFound(_) => ErrorKind::NotFound,
            GcsError::Invalid(_) => ErrorKind::Invalid,
            GcsError::Exhausted(_) => ErrorKind::Exhausted,
            GcsError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn detail(&self) -> &str {
        match self {
            GcsError::Transient(desc)
            | GcsError::NotFound(desc)
            | GcsError::Invalid(desc)
            | GcsError::Exhausted(desc)
            | GcsError::Fatal(desc) => desc,
        }
    }
}

impl Display for GcsError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            GcsError::Transient(desc) => write!(f, "Transient error: {desc}"),
            GcsError::NotFound(desc) => write!(f, "Not found: {desc}"),
            GcsError::Invalid(desc) => write!(f, "Invalid: {desc}"),
            GcsError::Exhausted(desc) => write!(f, "Exhausted: {desc}"),
            GcsError::Fatal(desc) => write!(f, "Fatal error: {desc}"),
        }
    }
}

impl Error for GcsError {}

impl From<io::Error> for GcsError {
    fn from(e: io::Error) -> Self {
        GcsError::Transient(format!("io error: {e}"))
    }
}

impl From<prost::DecodeError> for GcsError {
    fn from(e: prost::DecodeError) -> Self {
        GcsError::Invalid(format!("protobuf decode error: {e}"))
    }
}

impl From<Status> for GcsError {
    fn from(status: Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => GcsError::NotFound(status.message().to_owned()),
            tonic::Code::InvalidArgument => {
                GcsError::Invalid(status.message().to_owned())
            }
            tonic::Code::ResourceExhausted => {
                GcsError::Exhausted(status.message().to_owned())
            }
            tonic::Code::Internal => GcsError::Fatal(status.message().to_owned()),
            _ => GcsError::Transient(format!(
                "rpc failed with code {:?}: {}",
                status.code(),
                status.message()
            )),
        }
    }
}

impl From<GcsError> for Status {
    fn from(e: GcsError) -> Self {
        match e.kind() {
            ErrorKind::Transient => Status::unavailable(e.detail().to_owned()),
            ErrorKind::NotFound => Status::not_found(e.detail().to_owned()),
            ErrorKind::Invalid => Status::invalid_argument(e.detail().to_owned()),
            ErrorKind::Exhausted => Status::resource_exhausted(e.detail().to_owned()),
            ErrorKind::Fatal => Status::internal(e.detail().to_owned()),
        }
    }
}
