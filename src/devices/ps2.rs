use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::bus::{irq_source, Device, IrqLine, ListenerFn, Listeners};

pub const PS2_SIZE: u16 = 16;

// VIA register offsets (same layout as the peripheral controller)
const REG_PORTB: u16 = 0x00;
const REG_PORTA: u16 = 0x01; // scan codes appear here
const REG_DDRB: u16 = 0x02;
const REG_DDRA: u16 = 0x03;
const REG_T1CL: u16 = 0x04;
const REG_T1CH: u16 = 0x05;
const REG_T1LL: u16 = 0x06;
const REG_T1LH: u16 = 0x07;
const REG_T2CL: u16 = 0x08;
const REG_T2CH: u16 = 0x09;
const REG_SR: u16 = 0x0A;
const REG_ACR: u16 = 0x0B;
const REG_PCR: u16 = 0x0C;
const REG_IFR: u16 = 0x0D;
const REG_IER: u16 = 0x0E;
const REG_ORA_NH: u16 = 0x0F;

const IFR_CA1: u8 = 0x02; // data pending

const BREAK_PREFIX: u8 = 0xF0;
const SCAN_LEFT_SHIFT: u8 = 0x12;

/// Delay before re-asserting the interrupt when more scan codes wait in
/// the queue, approximating real PS/2 inter-byte timing.
const DELIVERY_PACING: Duration = Duration::from_millis(1);
/// Delay between scan codes of an injected sequence.
const SEQUENCE_PACING: Duration = Duration::from_millis(5);

/// Host keys the interface understands, mapped to Set-2 scan codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    A, B, C, D, E, F, G, H, I, J, K, L, M,
    N, O, P, Q, R, S, T, U, V, W, X, Y, Z,
    Digit0, Digit1, Digit2, Digit3, Digit4,
    Digit5, Digit6, Digit7, Digit8, Digit9,
    Space, Enter, Escape, Backspace, Delete, Tab,
    Shift, Control, Alt, CapsLock,
    Comma, Period, Slash, Semicolon, Quote,
    LeftBracket, RightBracket, Backslash,
    Minus, Equals, Backquote,
}

impl Key {
    /// Set-2 make code.
    pub fn scan_code(self) -> u8 {
        match self {
            Key::A => 0x1C,
            Key::B => 0x32,
            Key::C => 0x21,
            Key::D => 0x23,
            Key::E => 0x24,
            Key::F => 0x2B,
            Key::G => 0x34,
            Key::H => 0x33,
            Key::I => 0x43,
            Key::J => 0x3B,
            Key::K => 0x42,
            Key::L => 0x4B,
            Key::M => 0x3A,
            Key::N => 0x31,
            Key::O => 0x44,
            Key::P => 0x4D,
            Key::Q => 0x15,
            Key::R => 0x2D,
            Key::S => 0x1B,
            Key::T => 0x2C,
            Key::U => 0x3C,
            Key::V => 0x2A,
            Key::W => 0x1D,
            Key::X => 0x22,
            Key::Y => 0x35,
            Key::Z => 0x1A,
            Key::Digit0 => 0x45,
            Key::Digit1 => 0x16,
            Key::Digit2 => 0x1E,
            Key::Digit3 => 0x26,
            Key::Digit4 => 0x25,
            Key::Digit5 => 0x2E,
            Key::Digit6 => 0x36,
            Key::Digit7 => 0x3D,
            Key::Digit8 => 0x3E,
            Key::Digit9 => 0x46,
            Key::Space => 0x29,
            Key::Enter => 0x5A,
            Key::Escape => 0x76,
            Key::Backspace => 0x66,
            Key::Delete => 0x71,
            Key::Tab => 0x0D,
            Key::Shift => 0x12,
            Key::Control => 0x14,
            Key::Alt => 0x11,
            Key::CapsLock => 0x58,
            Key::Comma => 0x41,
            Key::Period => 0x49,
            Key::Slash => 0x4A,
            Key::Semicolon => 0x4C,
            Key::Quote => 0x52,
            Key::LeftBracket => 0x54,
            Key::RightBracket => 0x5B,
            Key::Backslash => 0x5D,
            Key::Minus => 0x4E,
            Key::Equals => 0x55,
            Key::Backquote => 0x0E,
        }
    }
}

struct Shared {
    queue: VecDeque<u8>,
    interrupt: bool,
}

/// PS/2 keyboard interface behind a W65C22 VIA.
///
/// Scan codes queue up from host input threads and surface one at a time
/// through Port A reads; the shared interrupt line is asserted whenever
/// data is waiting.
pub struct Ps2Interface {
    port_a: u8,
    port_b: u8,
    ddr_a: u8,
    ddr_b: u8,
    t1_counter_low: u8,
    t1_counter_high: u8,
    t1_latch_low: u8,
    t1_latch_high: u8,
    t2_counter_low: u8,
    t2_counter_high: u8,
    shift_register: u8,
    aux_control: u8,
    peripheral_control: u8,
    interrupt_flags: u8,
    interrupt_enable: u8,

    shared: Arc<Mutex<Shared>>,
    listeners: Arc<Mutex<Listeners>>,
    irq: IrqLine,
}

/// Cloneable producer-side handle. Host input threads push key events
/// and injected characters through this without touching the register
/// file.
#[derive(Clone)]
pub struct Ps2Input {
    shared: Arc<Mutex<Shared>>,
    listeners: Arc<Mutex<Listeners>>,
    irq: IrqLine,
}

impl Ps2Interface {
    pub fn new(irq: IrqLine) -> Self {
        Self {
            port_a: 0,
            port_b: 0,
            ddr_a: 0,
            ddr_b: 0,
            t1_counter_low: 0,
            t1_counter_high: 0,
            t1_latch_low: 0,
            t1_latch_high: 0,
            t2_counter_low: 0,
            t2_counter_high: 0,
            shift_register: 0,
            aux_control: 0,
            peripheral_control: 0,
            interrupt_flags: 0,
            interrupt_enable: 0,
            shared: Arc::new(Mutex::new(Shared {
                queue: VecDeque::new(),
                interrupt: false,
            })),
            listeners: Arc::new(Mutex::new(Listeners::new())),
            irq,
        }
    }

    /// Producer-side handle for host input.
    pub fn input(&self) -> Ps2Input {
        Ps2Input {
            shared: self.shared.clone(),
            listeners: self.listeners.clone(),
            irq: self.irq.clone(),
        }
    }

    pub fn add_listener(&self, listener: ListenerFn) {
        self.listeners.lock().unwrap().subscribe(listener);
    }

    pub fn reset(&mut self) {
        self.port_a = 0;
        self.port_b = 0;
        self.ddr_a = 0;
        self.ddr_b = 0;
        self.t1_counter_low = 0;
        self.t1_counter_high = 0;
        self.t1_latch_low = 0;
        self.t1_latch_high = 0;
        self.t2_counter_low = 0;
        self.t2_counter_high = 0;
        self.shift_register = 0;
        self.aux_control = 0;
        self.peripheral_control = 0;
        self.interrupt_flags = 0;
        self.interrupt_enable = 0;

        let mut shared = self.shared.lock().unwrap();
        shared.queue.clear();
        shared.interrupt = false;
        self.irq.clear(irq_source::PS2);
    }

    /// Pop the next scan code into Port A and manage the interrupt.
    fn read_port_a(&mut self) -> u8 {
        let mut shared = self.shared.lock().unwrap();
        if let Some(code) = shared.queue.pop_front() {
            self.port_a = code;
            shared.interrupt = false;
            self.irq.clear(irq_source::PS2);
            debug!("PS/2 port A read: scan code 0x{:02X}", code);

            if !shared.queue.is_empty() {
                // More data waiting: re-assert after a short delay so
                // each byte gets its own interrupt.
                let shared_handle = self.shared.clone();
                let irq = self.irq.clone();
                thread::spawn(move || {
                    thread::sleep(DELIVERY_PACING);
                    let mut shared = shared_handle.lock().unwrap();
                    if !shared.queue.is_empty() && !shared.interrupt {
                        shared.interrupt = true;
                        irq.assert(irq_source::PS2);
                    }
                });
            }
        }
        self.port_a
    }
}

impl Ps2Input {
    /// Push scan codes and assert the interrupt on the empty-to-nonempty
    /// transition.
    fn push_codes(&self, codes: &[u8]) {
        {
            let mut shared = self.shared.lock().unwrap();
            for &code in codes {
                shared.queue.push_back(code);
            }
            if !shared.queue.is_empty() && !shared.interrupt {
                shared.interrupt = true;
                self.irq.assert(irq_source::PS2);
            }
        }
        self.listeners.lock().unwrap().notify();
    }

    /// Host key press: queue the make code.
    pub fn key_down(&self, key: Key) {
        debug!("PS/2 key down: {:?}", key);
        self.push_codes(&[key.scan_code()]);
    }

    /// Host key release: queue break prefix + code. Caps lock is a
    /// toggle on some hosts (one event per physical press), so it sends
    /// another make code instead of a break sequence.
    pub fn key_up(&self, key: Key) {
        debug!("PS/2 key up: {:?}", key);
        if key == Key::CapsLock {
            self.push_codes(&[key.scan_code()]);
        } else {
            self.push_codes(&[BREAK_PREFIX, key.scan_code()]);
        }
    }

    /// Queue a raw scan code (console injection of prefix bytes, device
    /// responses, and the like).
    pub fn inject_scan_code(&self, code: u8) {
        self.push_codes(&[code]);
    }

    /// Turn a console character into a paced PS/2 make/break sequence.
    /// Upper-case letters and shifted punctuation get a surrounding
    /// shift press/release. Unknown characters are ignored.
    pub fn inject_char(&self, ch: char) {
        let Some(code) = char_to_scan_code(ch) else {
            debug!("no scan code mapping for {:?}", ch);
            return;
        };

        let sequence: Vec<u8> = if ch.is_ascii_uppercase() || is_shifted_punctuation(ch) {
            vec![
                SCAN_LEFT_SHIFT,
                code,
                BREAK_PREFIX,
                code,
                BREAK_PREFIX,
                SCAN_LEFT_SHIFT,
            ]
        } else {
            vec![code, BREAK_PREFIX, code]
        };

        let input = self.clone();
        thread::spawn(move || {
            for (i, &code) in sequence.iter().enumerate() {
                input.push_codes(&[code]);
                if i < sequence.len() - 1 {
                    thread::sleep(SEQUENCE_PACING);
                }
            }
        });
    }

    pub fn has_data(&self) -> bool {
        !self.shared.lock().unwrap().queue.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.lock().unwrap().queue.len()
    }

    pub fn clear_listeners(&self) {
        self.listeners.lock().unwrap().clear();
    }
}

impl Device for Ps2Interface {
    fn read(&mut self, offset: u16) -> u8 {
        match offset {
            REG_PORTB => self.port_b,
            REG_PORTA => self.read_port_a(),
            REG_DDRB => self.ddr_b,
            REG_DDRA => self.ddr_a,
            REG_T1CL => self.t1_counter_low,
            REG_T1CH => self.t1_counter_high,
            REG_T1LL => self.t1_latch_low,
            REG_T1LH => self.t1_latch_high,
            REG_T2CL => self.t2_counter_low,
            REG_T2CH => self.t2_counter_high,
            REG_SR => self.shift_register,
            REG_ACR => self.aux_control,
            REG_PCR => self.peripheral_control,
            REG_IFR => {
                let pending = self.shared.lock().unwrap().interrupt;
                self.interrupt_flags | if pending { IFR_CA1 } else { 0 }
            }
            REG_IER => self.interrupt_enable,
            REG_ORA_NH => self.port_a,
            _ => {
                warn!("read from invalid PS/2 VIA register 0x{:02X}", offset);
                0xFF
            }
        }
    }

    fn write(&mut self, offset: u16, value: u8) {
        match offset {
            REG_PORTB => self.port_b = value,
            // Port A carries the shift-register output; writes have no
            // effect on the keyboard side.
            REG_PORTA | REG_ORA_NH => {
                debug!("PS/2 port A write 0x{:02X} ignored (input only)", value);
            }
            REG_DDRB => self.ddr_b = value,
            REG_DDRA => self.ddr_a = value,
            REG_T1CL => self.t1_counter_low = value,
            REG_T1CH => self.t1_counter_high = value,
            REG_T1LL => self.t1_latch_low = value,
            REG_T1LH => self.t1_latch_high = value,
            REG_T2CL => self.t2_counter_low = value,
            REG_T2CH => self.t2_counter_high = value,
            REG_SR => self.shift_register = value,
            REG_ACR => self.aux_control = value,
            REG_PCR => self.peripheral_control = value,
            REG_IFR => self.interrupt_flags &= !value,
            REG_IER => self.interrupt_enable = value,
            _ => {
                warn!(
                    "write to invalid PS/2 VIA register 0x{:02X} = 0x{:02X}",
                    offset, value
                );
            }
        }
    }

    fn name(&self) -> &'static str {
        "PS/2 VIA Interface"
    }
}

fn char_to_scan_code(ch: char) -> Option<u8> {
    let code = match ch.to_ascii_lowercase() {
        'a' => 0x1C,
        'b' => 0x32,
        'c' => 0x21,
        'd' => 0x23,
        'e' => 0x24,
        'f' => 0x2B,
        'g' => 0x34,
        'h' => 0x33,
        'i' => 0x43,
        'j' => 0x3B,
        'k' => 0x42,
        'l' => 0x4B,
        'm' => 0x3A,
        'n' => 0x31,
        'o' => 0x44,
        'p' => 0x4D,
        'q' => 0x15,
        'r' => 0x2D,
        's' => 0x1B,
        't' => 0x2C,
        'u' => 0x3C,
        'v' => 0x2A,
        'w' => 0x1D,
        'x' => 0x22,
        'y' => 0x35,
        'z' => 0x1A,
        '0' | ')' => 0x45,
        '1' | '!' => 0x16,
        '2' | '@' => 0x1E,
        '3' | '#' => 0x26,
        '4' | '$' => 0x25,
        '5' | '%' => 0x2E,
        '6' | '^' => 0x36,
        '7' | '&' => 0x3D,
        '8' | '*' => 0x3E,
        '9' | '(' => 0x46,
        ' ' => 0x29,
        '.' | '>' => 0x49,
        ',' | '<' => 0x41,
        ';' | ':' => 0x4C,
        '/' | '?' => 0x4A,
        '\'' | '"' => 0x52,
        '[' | '{' => 0x54,
        ']' | '}' => 0x5B,
        '\\' | '|' => 0x5D,
        '-' | '_' => 0x4E,
        '=' | '+' => 0x55,
        '`' | '~' => 0x0E,
        '\r' | '\n' => 0x5A,
        '\x1B' => 0x76,
        '\x08' => 0x66,
        '\t' => 0x0D,
        _ => return None,
    };
    Some(code)
}

fn is_shifted_punctuation(ch: char) -> bool {
    matches!(
        ch,
        ':' | '!'
            | '@'
            | '#'
            | '$'
            | '%'
            | '^'
            | '&'
            | '*'
            | '('
            | ')'
            | '_'
            | '+'
            | '{'
            | '}'
            | '|'
            | '"'
            | '<'
            | '>'
            | '?'
            | '~'
    )
}
