#![no_main]

use libfuzzer_sys::fuzz_target;
use tender_stream::FrameDecoder;

fuzz_target!(|data: &[u8]| {
    let Some((&split_seed, body)) = data.split_first() else {
        return;
    };

    let mut whole = FrameDecoder::new();
    let mut expected = whole.feed(body);
    expected.extend(whole.flush());

    let split_at = usize::from(split_seed) % (body.len() + 1);
    let (head, tail) = body.split_at(split_at);
    let mut split = FrameDecoder::new();
    let mut actual = split.feed(head);
    actual.extend(split.feed(tail));
    actual.extend(split.flush());

    assert_eq!(actual, expected);
    if let Some(position) = actual.iter().position(|event| event.is_terminal()) {
        assert_eq!(position + 1, actual.len());
        assert!(split.is_terminated());
    }
});
