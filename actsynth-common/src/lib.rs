// SPDX-License-Identifier: Apache-2.0

pub mod binary_search;
pub mod status;
pub mod submodular;
