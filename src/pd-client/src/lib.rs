// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A client for the placement driver's HTTP API.
//!
//! Only the membership endpoints the operator needs are covered: listing
//! members and the current leader, checking member health, moving the
//! leader and removing a member. Binlog pumps register in the placement
//! driver's key space, which is read through its key-value gateway.

mod client;
mod config;
mod error;

pub use client::{Client, HealthStatus, Member, MembersInfo, PumpNode};
pub use config::{ClientBuilder, ClientConfig};
pub use error::{ApiError, Error};
