pub mod pm;
