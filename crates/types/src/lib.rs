//! Shared type definitions for pollflow workflows.

pub mod workflow;

pub use workflow::{
    GeneralOptions, HookDefinition, ITEM_KEY_FIELD, ITEM_SOURCE_INDEX_FIELD, InternalState, MAX_HISTORY_KEYS, StepDefinition,
    StepResponse, WorkflowDefinition,
};
