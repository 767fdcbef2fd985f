//! Input event queue shared by the keyboard and mouse interrupt handlers.
//!
//! A bounded single-producer/single-consumer ring: the IRQ handlers push,
//! the kernel main loop pops. When the ring is full the oldest event is
//! dropped so bursty input can never wedge an interrupt handler.

use spin::Mutex;

/// Number of event slots in the ring.
pub const EVENT_QUEUE_SIZE: usize = 256;

/// What happened, as reported by the PS/2 handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    None = 0,
    KeyDown = 1,
    KeyUp = 2,
    MouseMove = 3,
    MouseClick = 4,
}

/// One input event with an 8-byte device-specific payload.
///
/// KeyDown/KeyUp carry the translated ASCII byte in `data[0]` and the raw
/// scan code in `data[1]`; mouse events carry x/y as two little-endian u16s
/// and the button byte at `data[4]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: EventKind,
    pub data: [u8; 8],
}

impl InputEvent {
    pub const fn none() -> InputEvent {
        InputEvent {
            kind: EventKind::None,
            data: [0; 8],
        }
    }

    pub fn key_down(ascii: u8, scancode: u8) -> InputEvent {
        let mut event = InputEvent::none();
        event.kind = EventKind::KeyDown;
        event.data[0] = ascii;
        event.data[1] = scancode;
        event
    }

    pub fn key_up(ascii: u8, scancode: u8) -> InputEvent {
        let mut event = InputEvent::none();
        event.kind = EventKind::KeyUp;
        event.data[0] = ascii;
        event.data[1] = scancode;
        event
    }

    pub fn mouse_click(x: u16, y: u16, button: u8) -> InputEvent {
        let mut event = InputEvent::none();
        event.kind = EventKind::MouseClick;
        event.data[0..2].copy_from_slice(&x.to_le_bytes());
        event.data[2..4].copy_from_slice(&y.to_le_bytes());
        event.data[4] = button;
        event
    }
}

pub struct EventQueue {
    events: [InputEvent; EVENT_QUEUE_SIZE],
    head: usize,
    tail: usize,
}

impl EventQueue {
    pub const fn new() -> EventQueue {
        EventQueue {
            events: [InputEvent::none(); EVENT_QUEUE_SIZE],
            head: 0,
            tail: 0,
        }
    }

    pub fn push(&mut self, event: InputEvent) {
        let next_head = (self.head + 1) % EVENT_QUEUE_SIZE;
        if next_head == self.tail {
            // Full: drop the oldest event to make room.
            self.tail = (self.tail + 1) % EVENT_QUEUE_SIZE;
        }
        self.events[self.head] = event;
        self.head = next_head;
    }

    pub fn pop(&mut self) -> InputEvent {
        if self.head == self.tail {
            return InputEvent::none();
        }
        let event = self.events[self.tail];
        self.tail = (self.tail + 1) % EVENT_QUEUE_SIZE;
        event
    }

    pub fn pending(&self) -> bool {
        self.head != self.tail
    }

    pub fn len(&self) -> usize {
        (self.head + EVENT_QUEUE_SIZE - self.tail) % EVENT_QUEUE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

static EVENT_QUEUE: Mutex<EventQueue> = Mutex::new(EventQueue::new());

pub fn push_event(event: InputEvent) {
    EVENT_QUEUE.lock().push(event);
}

pub fn pop_event() -> InputEvent {
    EVENT_QUEUE.lock().pop()
}

pub fn events_pending() -> bool {
    EVENT_QUEUE.lock().pending()
}

pub fn events_clear() {
    EVENT_QUEUE.lock().clear();
}
