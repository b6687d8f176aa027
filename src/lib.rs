/*
 * 5D Labs Node Healthcheck Controller - Kubernetes Node Remediation
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Node health-check controller core library
//!
//! Watches cluster nodes against declarative `HealthCheckPolicy` resources
//! and, when a node stays unhealthy, requests remediation by materialising
//! request objects from user-supplied templates. Remediation itself is done
//! by external remediators watching those objects.

pub mod check;
pub mod crds;

// Re-export commonly used types
pub use check::{build_context, run_health_controller, Context, ControllerConfig, Error, Metrics};
pub use crds::{HealthCheckPolicy, HealthCheckPolicySpec, HealthCheckPolicyStatus, PolicyPhase};
