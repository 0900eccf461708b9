// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod capture_device;
pub mod error;
pub mod image_device;
pub mod orchestrator;
pub mod photo_store;
pub mod pipeline;
pub mod pixel_transform;
pub mod select_camera;
pub mod session_manager;
pub mod status;
