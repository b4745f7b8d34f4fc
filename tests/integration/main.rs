//! Integration tests for the relay
//! These tests run a real server on a local port and talk to it the way the
//! DG-Lab app does.

pub mod app_client;
pub mod relay_harness;

pub mod relay_server_test;
