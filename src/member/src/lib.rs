// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Member reconciliation and rolling upgrades for the components of a TiDB
//! cluster.
//!
//! Each component runs as one ordinal-addressed replica group. A pass of
//! [`MemberSynchronizer::sync`] observes the group, then scales it one
//! member at a time with the [`Scaler`] and rolls it one member at a time
//! with the [`Upgrader`]. Passes are level-triggered: every decision is
//! recomputed from what was observed at the start of the pass, so a pass can
//! be interrupted and rerun at any point.

mod error;

pub mod config_map;
pub mod control;
pub mod leader;
pub mod ordinal;
pub mod quantity;
pub mod replica_group;
pub mod scaler;
pub mod service;
pub mod status;
pub mod sync;
pub mod upgrader;

pub use error::Error;
pub use ordinal::{DesiredTopology, LiveOrdinals, live_ordinals};
pub use replica_group::{ReplicaGroup, RolloutStrategy, UpgradeCursor};
pub use scaler::{ScaleAction, Scaler};
pub use status::{MemberRecord, MemberStatusView};
pub use sync::{MemberSynchronizer, SyncConfig, SyncOutcome};
pub use upgrader::{UpgradeOutcome, Upgrader};
