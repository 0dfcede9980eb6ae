/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

pub mod conflict_log;
pub mod engine;
pub mod merge;

pub use conflict_log::ConflictLogEntry;
pub use engine::{SyncEngine, SyncResult, LAST_ERROR_KEY, LAST_SYNC_AT_KEY};
pub use merge::{Escalation, FieldResolution, MergeOutcome, MergeRule};
