// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Job status notifications.
//!
//! Events arriving on the status channel are checked against each job's
//! notification policy. Failures that want email are batched by
//! [`FailureAggregator`], rendered by [`AlertComposer`] and delivered by
//! [`AlertTransport`], which keeps a local copy when the relay is down.
//! [`NotificationPipeline`] ties these together for the scheduler loop.

pub mod aggregator;
pub mod composer;
pub mod details;
mod files;
pub mod listener;
pub mod pipeline;
pub mod policy;
pub mod transport;

pub use aggregator::{FailureAggregator, FailureBatch, FailureRecord};
pub use composer::{html_escape, render_body, subject, AlertComposer, OutboundAlert};
pub use details::{DetailCollector, HostProbe};
pub use listener::{NotificationListener, RouteDecision};
pub use pipeline::NotificationPipeline;
pub use policy::{should_notify, NotificationSettings, NotifyWhen, PolicyEngine};
pub use transport::{AlertTransport, DeliveryOutcome};

#[cfg(test)]
pub(crate) fn test_time(value: &str) -> chrono::DateTime<chrono::Utc> {
	pgagent_db::parse_timestamp(value).unwrap()
}
