// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A tier of the database cluster, managed as one replicated process group.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum MemberType {
    /// The placement driver: cluster coordination and leader election.
    Pd,
    /// Row storage.
    Tikv,
    /// Columnar storage replicas.
    Tiflash,
    /// Binlog collection.
    Pump,
    /// SQL compute.
    Tidb,
    /// Change data capture.
    Ticdc,
}

impl MemberType {
    /// All member types, in the order a reconciliation pass visits them.
    pub const ALL: [MemberType; 6] = [
        MemberType::Pd,
        MemberType::Tikv,
        MemberType::Tiflash,
        MemberType::Pump,
        MemberType::Tidb,
        MemberType::Ticdc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemberType::Pd => "pd",
            MemberType::Tikv => "tikv",
            MemberType::Tiflash => "tiflash",
            MemberType::Pump => "pump",
            MemberType::Tidb => "tidb",
            MemberType::Ticdc => "ticdc",
        }
    }

    /// The components that must not be mid-upgrade while this one scales or
    /// upgrades.
    pub fn upstreams(&self) -> &'static [MemberType] {
        match self {
            MemberType::Ticdc => &[],
            MemberType::Pd => &[MemberType::Ticdc],
            MemberType::Tiflash => &[MemberType::Ticdc, MemberType::Pd],
            MemberType::Tikv => &[MemberType::Ticdc, MemberType::Tiflash, MemberType::Pd],
            MemberType::Pump => &[
                MemberType::Ticdc,
                MemberType::Tiflash,
                MemberType::Pd,
                MemberType::Tikv,
            ],
            MemberType::Tidb => &[
                MemberType::Ticdc,
                MemberType::Tiflash,
                MemberType::Pd,
                MemberType::Tikv,
                MemberType::Pump,
            ],
        }
    }

    /// Whether members of this type elect a leader through the coordination
    /// service, and so must hand leadership off before being replaced.
    pub fn elects_leader(&self) -> bool {
        matches!(self, MemberType::Pd)
    }

    /// The port members of this type serve their peers on.
    pub fn peer_port(&self) -> u16 {
        match self {
            MemberType::Pd => 2380,
            MemberType::Tikv => 20160,
            MemberType::Tiflash => 3930,
            MemberType::Pump => 8250,
            MemberType::Tidb => 10080,
            MemberType::Ticdc => 8301,
        }
    }

    /// The annotation on a `TidbCluster` holding the JSON-encoded set of
    /// ordinals removed from this component.
    pub fn delete_slots_annotation(&self) -> String {
        format!("{}.tidb.pingcap.com/delete-slots", self.as_str())
    }
}

impl fmt::Display for MemberType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The coarse lifecycle state of a component.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum MemberPhase {
    #[default]
    Normal,
    Scaling,
    Upgrading,
}

impl fmt::Display for MemberPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            MemberPhase::Normal => "Normal",
            MemberPhase::Scaling => "Scaling",
            MemberPhase::Upgrading => "Upgrading",
        })
    }
}
