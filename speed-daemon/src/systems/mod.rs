pub mod record;
pub mod ticket;

pub type Road = u16;
pub type Mile = u16;
pub type Limit = u16;
pub type Plate = String;
pub type Timestamp = u32;
