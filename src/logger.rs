/// This target is used exclusively to handle group events.
pub const GROUP_TARGET: &str = "hangwatch::group";
pub const OPENED_GROUP_TARGET: &str = "hangwatch::group::opened";

/// Target used for lines echoed from the supervised workload's output streams.
pub const WORKLOAD_TARGET: &str = "workload";

#[macro_export]
/// Start a new log group. All logs between this and the next `end_group!` will be grouped together.
///
/// # Example
///
/// ```rust
/// # use hangwatch::{start_group, end_group};
/// start_group!("Supervising workload");
/// log::info!("This will be grouped");
/// end_group!();
/// ```
macro_rules! start_group {
    ($name:expr) => {
        log::log!(target: $crate::logger::GROUP_TARGET, log::Level::Info, "{}", $name);
    };
}

#[macro_export]
/// Start a new opened log group. All logs between this and the next `end_group!` will be grouped together.
macro_rules! start_opened_group {
    ($name:expr) => {
        log::log!(target: $crate::logger::OPENED_GROUP_TARGET, log::Level::Info, "{}", $name);
    };
}

#[macro_export]
/// End the current log group.
/// See [`start_group!`] for more information.
macro_rules! end_group {
    () => {
        log::log!(target: $crate::logger::GROUP_TARGET, log::Level::Info, "");
    };
}

pub enum GroupEvent {
    Start(String),
    StartOpened(String),
    End,
}

/// Returns the group event if the record is a group event, otherwise returns `None`.
pub(crate) fn get_group_event(record: &log::Record) -> Option<GroupEvent> {
    match record.target() {
        OPENED_GROUP_TARGET => {
            let args = record.args().to_string();
            if args.is_empty() {
                None
            } else {
                Some(GroupEvent::StartOpened(args))
            }
        }
        GROUP_TARGET => {
            let args = record.args().to_string();
            if args.is_empty() {
                Some(GroupEvent::End)
            } else {
                Some(GroupEvent::Start(args))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_event_for(target: &str, message: &str) -> Option<GroupEvent> {
        get_group_event(
            &log::Record::builder()
                .target(target)
                .level(log::Level::Info)
                .args(format_args!("{message}"))
                .build(),
        )
    }

    #[test]
    fn test_group_events_are_recognized() {
        assert!(matches!(
            group_event_for(GROUP_TARGET, "Supervising"),
            Some(GroupEvent::Start(name)) if name == "Supervising"
        ));
        assert!(matches!(
            group_event_for(GROUP_TARGET, ""),
            Some(GroupEvent::End)
        ));
        assert!(matches!(
            group_event_for(OPENED_GROUP_TARGET, "Recovery"),
            Some(GroupEvent::StartOpened(name)) if name == "Recovery"
        ));
        assert!(group_event_for(WORKLOAD_TARGET, "line").is_none());
    }
}
