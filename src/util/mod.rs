pub mod dates;

pub use dates::parse_flexible_date;
