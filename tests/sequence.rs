use std::collections::HashSet;
use surface_bufferqueue::Core::alloc::SequenceGenerator;

#[test]
fn low_half_wraps_and_keeps_the_pid_half() {
    let sequences = SequenceGenerator::starting_at(0x1234_FFFE);
    assert_eq!(sequences.next(), 0x1234_FFFE);
    assert_eq!(sequences.next(), 0x1234_FFFF);
    assert_eq!(sequences.next(), 0x1234_0000);
}

#[test]
fn sequences_in_use_are_skipped() {
    let sequences = SequenceGenerator::starting_at(0x0042_0000);
    let taken: HashSet<u32> = [0x0042_0000, 0x0042_0001].into_iter().collect();
    assert_eq!(sequences.next_unused(|s| taken.contains(&s)), Some(0x0042_0002));
    assert_eq!(sequences.next_unused(|_| true), None);
}

#[test]
fn default_generator_is_tagged_with_the_pid() {
    let seq = SequenceGenerator::new().next();
    assert_eq!(seq >> 16, std::process::id() & 0xFFFF);
}
