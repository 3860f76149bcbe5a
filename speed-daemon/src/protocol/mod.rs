pub mod deserializer;
pub mod message;
pub mod serializer;
