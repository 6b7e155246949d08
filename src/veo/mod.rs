//! Veo generative video API integration module.
//!
//! This module talks to a Veo-style video generation service: a request is
//! submitted as a long-running operation, polled until it reaches a terminal
//! state, and the resulting video is downloaded to disk.

mod client;

pub use client::{
    setup_ctrlc_handler, AspectRatio, CancelToken, GenerationRequest, Operation, Resolution,
    VeoClient, VeoError, DEFAULT_GENERATION_TIMEOUT, DEFAULT_MODEL, DEFAULT_POLL_INTERVAL,
    DEFAULT_PROMPT, GEMINI_API_KEY_ENV, VEO_API_BASE_URL,
};
