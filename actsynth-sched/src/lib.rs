// SPDX-License-Identifier: Apache-2.0

//! Pipeline scheduling: node-to-cycle assignment under a clock-period
//! constraint, with min-cut and SDC (LP) register-minimizing strategies, plus
//! schedule-aware rematerialization.

pub mod delay_model;
pub mod function_partition;
pub mod pipeline_schedule;
pub mod remat;
pub mod schedule_bounds;
