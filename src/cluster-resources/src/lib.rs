// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Custom resources describing a managed TiDB cluster, and the naming
//! conventions shared by everything that reconciles them.

pub mod crd;
pub mod member;

pub use member::{MemberPhase, MemberType};
