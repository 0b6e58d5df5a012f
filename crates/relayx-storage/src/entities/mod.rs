pub mod request_records;

pub use request_records::Entity as RequestRecords;
