pub mod jr;
