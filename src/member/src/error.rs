// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use tidb_cluster_resources::MemberType;

/// Why a reconciliation pass stopped early.
///
/// The variant decides how the pass is retried, and is never changed on the
/// way up to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The desired state can't be acted on as written. Retrying won't help
    /// until someone edits it.
    #[error("invalid {member_type} configuration: {message}")]
    Fatal {
        member_type: MemberType,
        message: String,
    },
    /// The pass is waiting on something that is expected to resolve by
    /// itself: a member becoming ready, a leadership transfer landing, an
    /// upstream component finishing its upgrade.
    #[error("{0}")]
    Requeue(String),
    /// Talking to the substrate or the coordination service failed.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl Error {
    pub fn fatal(member_type: MemberType, message: impl Into<String>) -> Error {
        Error::Fatal {
            member_type,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }

    pub fn is_requeue(&self) -> bool {
        matches!(self, Error::Requeue(_))
    }
}

/// Returns early with an [`Error::Requeue`].
#[macro_export]
macro_rules! requeue {
    ($($arg:tt)*) => {
        return Err($crate::Error::Requeue(format!($($arg)*)))
    };
}
