use super::*;

#[test]
fn test_identity_until_first_sync() {
    let mut seqs: SeqManager<u16> = SeqManager::for_seqs();

    assert_eq!(seqs.input(1000), 1000);
    assert_eq!(seqs.input(1001), 1001);
    assert_eq!(seqs.input(1002), 1002);
}

#[test]
fn test_sync_continues_after_max_output() {
    let mut seqs: SeqManager<u16> = SeqManager::for_seqs();

    assert_eq!(seqs.input(1000), 1000);
    assert_eq!(seqs.input(1001), 1001);

    // producer resynced far away
    seqs.sync(5000);
    assert_eq!(seqs.input(5000), 1002);
    assert_eq!(seqs.input(5001), 1003);

    // and again, backwards this time
    seqs.sync(100);
    assert_eq!(seqs.input(100), 1004);
    assert_eq!(seqs.input(101), 1005);
}

#[test]
fn test_drop_closes_the_gap() {
    let mut seqs: SeqManager<u16> = SeqManager::for_seqs();

    assert_eq!(seqs.input(10), 10);
    seqs.drop_input(11);
    assert_eq!(seqs.input(12), 11);
    assert_eq!(seqs.input(13), 12);

    seqs.drop_input(14);
    seqs.drop_input(15);
    assert_eq!(seqs.input(16), 13);
}

#[test]
fn test_drop_of_old_input_is_ignored() {
    let mut seqs: SeqManager<u16> = SeqManager::for_seqs();

    assert_eq!(seqs.input(10), 10);
    assert_eq!(seqs.input(11), 11);

    // 9 was already overtaken; dropping it must not retro-shift outputs
    seqs.drop_input(9);
    assert_eq!(seqs.input(12), 12);
}

#[test]
fn test_wrap_around() {
    let mut seqs: SeqManager<u16> = SeqManager::for_seqs();

    assert_eq!(seqs.input(65534), 65534);
    assert_eq!(seqs.input(65535), 65535);
    assert_eq!(seqs.input(0), 0);
    assert_eq!(seqs.input(1), 1);
    assert_eq!(seqs.max_output(), 1);
}

#[test]
fn test_sync_across_wrap() {
    let mut seqs: SeqManager<u16> = SeqManager::for_seqs();

    assert_eq!(seqs.input(65533), 65533);
    assert_eq!(seqs.input(65534), 65534);
    seqs.sync(10000);
    assert_eq!(seqs.input(10000), 65535);
    assert_eq!(seqs.input(10001), 0);
}

#[test]
fn test_timestamp_sync_with_offset() {
    let mut timestamps: SeqManager<u32> = SeqManager::for_timestamps();

    assert_eq!(timestamps.input(90000), 90000);
    assert_eq!(timestamps.input(93000), 93000);

    // resume 500 ms later at clock rate 90000: 45000 ticks of silence
    timestamps.sync(700_000);
    timestamps.offset(45000);
    assert_eq!(timestamps.input(700_000), 93000 + 45000);
    assert_eq!(timestamps.input(703_000), 93000 + 45000 + 3000);
}

#[test]
fn test_input_drop_interleaved_with_sync() {
    let mut seqs: SeqManager<u16> = SeqManager::for_seqs();

    assert_eq!(seqs.input(100), 100);
    seqs.drop_input(101);
    assert_eq!(seqs.input(102), 101);

    seqs.sync(5000);
    // dropped set is cleared by sync
    assert_eq!(seqs.input(5000), 102);
}
