#![no_main]

use agora_client::{flush_frames, EventInterpreter, FrameDecoder, StreamEvent};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let one_shot = flush_frames(&text);

    let split = data.first().map(|byte| *byte as usize).unwrap_or(0) % (data.len() + 1);
    let mut decoder = FrameDecoder::new();
    let mut incremental = decoder.push_bytes(&data[..split]);
    incremental.extend(decoder.push_bytes(&data[split..]));
    incremental.extend(decoder.finish());
    assert_eq!(incremental, one_shot);

    let mut interpreter = EventInterpreter::new();
    let mut events = interpreter.push_bytes(data);
    events.extend(interpreter.finish());
    let done_count = events.iter().filter(|event| event.is_terminal()).count();
    assert!(done_count <= 1);
    if let Some(position) = events.iter().position(StreamEvent::is_terminal) {
        assert_eq!(position + 1, events.len());
    }
});
