//! Installscope captures what a Windows installer changes and turns the
//! evidence into deployment artifacts.
//!
//! Pipeline: [`services::collector`] → [`services::differ`] →
//! [`services::change_record`] → {[`services::detection`], [`services::uninstall`]}.

pub mod services;
