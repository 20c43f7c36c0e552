mod appointment;
mod attendance;
mod feedback;
mod inventory;
mod invoice;
mod patient;
mod record;
mod report;
mod salary;
mod settings;
mod staff;

pub use appointment::{Appointment, AppointmentStatus};
pub use attendance::{Attendance, AttendanceStatus};
pub use feedback::Feedback;
pub use inventory::{InventoryItem, UsageRecord};
pub use invoice::{Invoice, InvoiceItem, InvoiceStatus};
pub use patient::Patient;
pub use record::{apply_patch, to_fields, Entity, Record, RecordId, SyncStatus, TEMP_ID_PREFIX};
pub use report::Report;
pub use salary::Salary;
pub use settings::Settings;
pub use staff::Staff;
