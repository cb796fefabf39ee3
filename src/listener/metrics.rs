/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge};

use super::Stage;
use crate::{
    metrics::{opts, register},
    push::ConflictKind,
};

const SUBSYSTEM: &str = "listener";

pub(crate) const KIND_LABEL: &str = "kind";
pub(crate) const STAGE_LABEL: &str = "stage";

pub(crate) fn conflicts(kind: ConflictKind) -> IntCounter {
    static CONFLICTS: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "conflicts",
                    SUBSYSTEM,
                    "Total number of listener contributions rejected due to a conflict",
                ),
                &[KIND_LABEL],
            )
            .unwrap(),
        )
    });

    CONFLICTS.with_label_values(&[kind.as_ref()])
}

pub(crate) fn invalid_outbound_listeners() -> &'static IntGauge {
    static INVALID_OUTBOUND_LISTENERS: Lazy<IntGauge> = Lazy::new(|| {
        register(
            IntGauge::with_opts(opts(
                "invalid_outbound",
                SUBSYSTEM,
                "Number of outbound listeners dropped by validation",
            ))
            .unwrap(),
        )
    });

    &INVALID_OUTBOUND_LISTENERS
}

pub(crate) fn dropped_listeners(stage: Stage) -> IntCounter {
    static DROPPED_LISTENERS: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "dropped",
                    SUBSYSTEM,
                    "Total number of listeners abandoned while being built",
                ),
                &[STAGE_LABEL],
            )
            .unwrap(),
        )
    });

    DROPPED_LISTENERS.with_label_values(&[stage.as_ref()])
}
