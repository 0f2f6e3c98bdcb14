// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use url::Url;

use crate::client::Client;
use crate::error::Error;

/// Configures the required parameters of a [`Client`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// The placement driver's client URL, e.g. `http://basic-pd.db:2379`.
    pub endpoint: Url,
}

/// A builder for a [`Client`].
#[derive(Clone, Debug)]
pub struct ClientBuilder {
    timeout: Duration,
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder {
            timeout: Duration::from_secs(5),
        }
    }
}

impl ClientBuilder {
    /// Bounds how long any single request may take.
    pub fn timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.timeout = timeout;
        self
    }

    pub fn build(self, config: ClientConfig) -> Result<Client, Error> {
        let inner = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.timeout)
            .build()?;
        Ok(Client::new(inner, config.endpoint))
    }
}
