// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Synchronization bridge between the host thread and the worker thread.

pub mod event;
pub mod gate;
pub mod worker;

pub use event::EventKind;
pub use gate::LifecycleState;
