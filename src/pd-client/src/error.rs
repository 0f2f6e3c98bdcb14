// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

/// A non-success response from the placement driver.
#[derive(Debug, Clone)]
pub struct ApiError {
    /// The HTTP status code.
    pub status_code: StatusCode,
    /// The response body, which the placement driver fills with a
    /// human-readable reason.
    pub message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (status {})", self.message.trim(), self.status_code)
    }
}

impl std::error::Error for ApiError {}

#[derive(Error, Debug)]
pub enum Error {
    #[error("pd error: transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("pd error: api: {0}")]
    Api(#[from] ApiError),
    #[error("pd error: endpoint {0} cannot be a base url")]
    CannotBeABase(url::Url),
    #[error("pd error: malformed registry value: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("pd error: malformed registry value: {0}")]
    Json(#[from] serde_json::Error),
}
