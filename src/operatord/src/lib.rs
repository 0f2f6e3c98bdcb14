// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The TiDB operator: watches `TidbCluster` resources and reconciles each of
//! their components with [`tidb_member::MemberSynchronizer`].

use std::fmt::Display;

pub mod controller;
pub mod k8s;
pub mod pd;
pub mod resources;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Anyhow(#[from] anyhow::Error),
    Kube(#[from] kube::Error),
    Member(#[from] tidb_member::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anyhow(e) => write!(f, "{e:#}"),
            Self::Kube(e) => write!(f, "{e}"),
            Self::Member(e) => write!(f, "{e}"),
        }
    }
}
