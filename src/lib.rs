//! Room occupancy classification from a ceiling camera.
//!
//! A frame is rotated, cropped and split into five overlapping regions; each
//! region is equalized, squared, mean-normalized and classified. The five class
//! indices form the room vector printed once per capture interval.

pub mod accelerator;
pub mod app;
pub mod args;
pub mod camera;
pub mod capture_loop;
pub mod debug;
pub mod geometry;
pub mod mean;
