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

//! Ballista sort error types

use std::{
    error::Error,
    fmt::{Display, Formatter},
    io, result,
};

use arrow::error::ArrowError;

/// Result type alias for external sort operations.
pub type Result<T> = result::Result<T, SortError>;

/// Error types for the external sort engine.
#[derive(Debug)]
pub enum SortError {
    /// Inconsistent memory budget or tuning settings, or a record that can
    /// never fit into a sort buffer. Reported before any work starts.
    Configuration(String),
    /// A sort buffer cannot grab another segment. This drives sealing and
    /// spilling and is not surfaced to callers of the sorter.
    CapacityExceeded,
    /// A record could not be serialized or deserialized.
    Serialization(String),
    /// Error from the Arrow IPC spill format.
    ArrowError(Box<ArrowError>),
    /// I/O operation error on a spill channel.
    IoError(io::Error),
    /// A background stage panicked or was aborted.
    TokioError(tokio::task::JoinError),
    /// General error with a descriptive message.
    General(String),
    /// Internal error indicating a bug or unexpected state.
    Internal(String),
    /// The sort was stopped before it completed.
    Cancelled,
}

#[allow(clippy::from_over_into)]
impl<T> Into<Result<T>> for SortError {
    fn into(self) -> Result<T> {
        Err(self)
    }
}

/// Creates a general sort error from a string message.
pub fn sort_error(message: &str) -> SortError {
    SortError::General(message.to_owned())
}

impl SortError {
    /// Returns true for errors that abort the whole sort, as opposed to the
    /// internal capacity signal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SortError::CapacityExceeded)
    }
}

impl From<String> for SortError {
    fn from(e: String) -> Self {
        SortError::General(e)
    }
}

impl From<ArrowError> for SortError {
    fn from(e: ArrowError) -> Self {
        match e {
            ArrowError::IoError(_, e) => SortError::IoError(e),
            ArrowError::ExternalError(e) if e.downcast_ref::<SortError>().is_some() => {
                match e.downcast::<SortError>() {
                    Ok(e) => *e,
                    Err(e) => SortError::General(e.to_string()),
                }
            }
            other => SortError::ArrowError(Box::new(other)),
        }
    }
}

impl From<io::Error> for SortError {
    fn from(e: io::Error) -> Self {
        SortError::IoError(e)
    }
}

impl From<tokio::task::JoinError> for SortError {
    fn from(e: tokio::task::JoinError) -> Self {
        SortError::TokioError(e)
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            SortError::Configuration(desc) => {
                write!(f, "Configuration error: {desc}")
            }
            SortError::CapacityExceeded => {
                write!(f, "Sort buffer capacity exceeded")
            }
            SortError::Serialization(desc) => {
                write!(f, "Serialization error: {desc}")
            }
            SortError::ArrowError(desc) => write!(f, "Arrow error: {desc}"),
            SortError::IoError(desc) => write!(f, "IO error: {desc}"),
            SortError::TokioError(desc) => write!(f, "Tokio join error: {desc}"),
            SortError::General(desc) => write!(f, "General error: {desc}"),
            SortError::Internal(desc) => {
                write!(f, "Internal sort error: {desc}")
            }
            SortError::Cancelled => write!(f, "Sort cancelled"),
        }
    }
}

impl Error for SortError {}
