pub mod reminders;
pub mod transitions;
