use super::*;

#[test]
fn test_no_loss_no_nacks() {
    let mut generator = NackGenerator::new(1);

    for seq in 100..200u16 {
        generator.received(seq);
    }
    assert!(generator.poll_missing(1000).is_empty());
}

#[test]
fn test_gap_is_reported_once_skip_window_passes() {
    let mut generator = NackGenerator::new(1);

    generator.received(100);
    generator.received(101);
    // 102 lost
    generator.received(103);
    // still inside the skip window
    assert!(generator.poll_missing(1000).is_empty());

    generator.received(104);
    generator.received(105);
    assert_eq!(generator.poll_missing(1010), vec![102]);

    // immediately polling again must not re-request
    assert!(generator.poll_missing(1011).is_empty());
}

#[test]
fn test_retry_after_interval() {
    let mut generator = NackGenerator::new(1);

    for seq in [100u16, 101, 103, 104, 105] {
        generator.received(seq);
    }
    assert_eq!(generator.poll_missing(1000), vec![102]);
    assert!(generator.poll_missing(1040).is_empty());
    assert_eq!(generator.poll_missing(1050), vec![102]);
}

#[test]
fn test_recovered_packet_stops_retries() {
    let mut generator = NackGenerator::new(1);

    for seq in [100u16, 101, 103, 104, 105] {
        generator.received(seq);
    }
    assert_eq!(generator.poll_missing(1000), vec![102]);

    // retransmission arrived
    generator.received(102);
    assert!(generator.poll_missing(1100).is_empty());
}

#[test]
fn test_multiple_holes() {
    let mut generator = NackGenerator::new(1);

    for seq in [1000u16, 1001, 1003, 1005, 1006, 1007, 1008] {
        generator.received(seq);
    }
    assert_eq!(generator.poll_missing(1000), vec![1002, 1004]);
}

#[test]
fn test_rollover() {
    let mut generator = NackGenerator::new(1);

    generator.received(65533);
    generator.received(65534);
    generator.received(65535);
    generator.received(0);
    // 1 lost
    generator.received(2);
    generator.received(3);
    generator.received(4);
    assert_eq!(generator.poll_missing(1000), vec![1]);
}
