// SPDX-License-Identifier: Apache-2.0

pub mod bounded_channel;
pub mod broker;
pub mod config;
pub mod depth;
pub mod error;
pub mod offsets;
pub mod parsers;
pub mod record;
pub mod sender;
pub mod tailer;
