pub mod catalog;
pub mod core;
pub mod import;
pub mod marks;
pub mod scope;
pub mod students;
pub mod users;
pub mod years;
