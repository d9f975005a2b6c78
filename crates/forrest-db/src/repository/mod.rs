//! # Repository Module
//!
//! - [`StateRepository`](state::StateRepository) - named JSON cells in `state_cells`

pub mod state;
