pub mod alias;
pub mod bit_reader;
pub mod entitydefs;
pub mod typedefs;
