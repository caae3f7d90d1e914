/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

#[macro_use]
mod error;

mod alter;
mod capture;
mod changes;
mod clock;
mod conn_ext;
mod context;
mod pk_codec;
mod registry;
mod schema;
mod schema_hash;
mod settings;
mod site_id;
mod sync;
mod transport;
mod util;
mod uuid7;

pub use crate::context::{Config, Context};
pub use crate::error::*;
pub use crate::registry::Algorithm;
pub use crate::sync::payload::ApplyReport;
pub use crate::transport::NetworkConfig;
