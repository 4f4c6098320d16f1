use anvil_types::ScheduleError;

#[test]
fn display_messages_name_the_failure() {
    let error = ScheduleError::invalid_priority(5, 2);
    assert_eq!(
        error.to_string(),
        "Invalid priority level: 5 (configured levels: 2)"
    );

    let error = ScheduleError::queue_full("level 0 at capacity");
    assert!(error.to_string().contains("Queue is full"));

    assert_eq!(
        ScheduleError::ShuttingDown.to_string(),
        "Scheduler is shutting down"
    );
}

#[test]
fn classifiers_partition_the_taxonomy() {
    assert!(ScheduleError::invalid_priority(9, 1).is_client_error());
    assert!(ScheduleError::shape_mismatch("bad dims").is_client_error());
    assert!(!ScheduleError::queue_full("full").is_client_error());

    assert!(ScheduleError::queue_full("full").is_capacity_error());
    assert!(ScheduleError::queue_displaced("pushed out").is_capacity_error());
    assert!(ScheduleError::timed_out("too slow").is_capacity_error());
    assert!(!ScheduleError::ShuttingDown.is_capacity_error());

    assert!(ScheduleError::execute_failed("backend").is_terminal());
    assert!(!ScheduleError::internal("bug").is_terminal());
}

#[test]
fn errors_round_trip_through_serde() {
    let error = ScheduleError::execute_failed("device lost");
    let json = serde_json::to_string(&error).unwrap();
    let parsed: ScheduleError = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, error);
}
