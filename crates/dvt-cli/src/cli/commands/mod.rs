pub mod fetch;
pub mod master;
pub mod nodes;
pub mod status;
pub mod submit;
pub mod worker;
