//! Nightjar: dual-radio handheld assessment firmware.
//!
//! Two tasks share one static [`Context`]: the orchestrator owns the
//! capability providers and runs the loop; the console reads NDJSON
//! commands from UART0 and streams events back. The BLE host stack runs in
//! the main task and is steered by the BLE provider.

#![no_std]
#![no_main]

extern crate alloc;

use esp_backtrace as _;

esp_bootloader_esp_idf::esp_app_desc!();

mod ble_provider;
mod wifi_provider;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Delay, Duration, Instant, Timer};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::peripherals::TIMG1;
use esp_hal::timer::timg::{MwdtStage, TimerGroup, Wdt};
use esp_hal::uart::{self, Uart, UartRx, UartTx};
use esp_hal::Async;
use static_cell::StaticCell;

use trouble_host::prelude::*;

use nightjar::board::{self, REGISTRY_CAPACITY};
use nightjar::config::Config;
use nightjar::console::{render_event, Console, LineReader, LineSink, SERIAL_BAUD};
use nightjar::context::Context;
use nightjar::diag::MemoryProbe;
use nightjar::orchestrator::{Clock, Orchestrator, Platform, RecordSink, Watchdog};
use nightjar::protocol::VERSION;
use nightjar::provider::{Absent, ProviderSet};

use ble_provider::{BleProvider, ScanEventHandler};
use wifi_provider::WifiProvider;

type DeviceContext = Context<'static, CriticalSectionRawMutex, REGISTRY_CAPACITY>;

/// Shared by the orchestrator and console tasks
static CONTEXT: DeviceContext = Context::new();

/// Hardware watchdog timeout. The orchestrator feeds it every iteration.
const WATCHDOG_TIMEOUT_S: u64 = 5;

/// Console poll interval when no input arrives
const CONSOLE_POLL_MS: u64 = 20;

// ── Platform services ────────────────────────────────────────────────

struct UptimeClock;

impl Clock for UptimeClock {
    fn now_ms(&self) -> u64 {
        Instant::now().as_millis()
    }
}

struct TimgWatchdog(Wdt<TIMG1<'static>>);

impl Watchdog for TimgWatchdog {
    fn feed(&mut self) {
        self.0.feed();
    }
}

struct HeapProbe;

impl MemoryProbe for HeapProbe {
    fn heap_free(&self) -> usize {
        esp_alloc::HEAP.free()
    }
}

/// Records go to the log console, one NDJSON line each.
struct LogRecords;

impl RecordSink for LogRecords {
    fn append(&mut self, line: &[u8]) -> bool {
        match core::str::from_utf8(line) {
            Ok(s) => {
                esp_println::print!("{}", s);
                true
            }
            Err(_) => false,
        }
    }
}

struct SerialOut<'a>(&'a mut UartTx<'static, Async>);

impl LineSink for SerialOut<'_> {
    fn write_line(&mut self, line: &[u8]) {
        let mut rest = line;
        while !rest.is_empty() {
            match self.0.write(rest) {
                Ok(0) | Err(_) => break,
                Ok(n) => rest = &rest[n..],
            }
        }
    }
}

// ── Tasks ────────────────────────────────────────────────────────────

#[embassy_executor::task]
async fn orchestrator_task(wifi: &'static mut WifiProvider, watchdog: Wdt<TIMG1<'static>>) {
    let mut ble = BleProvider::new();
    // No board links an IR transmit primitive yet
    if !board::HAS_IR_TX {
        log::info!("No IR transmitter on {}", board::BOARD_NAME);
    }
    let mut ir = Absent("ir");
    let mut watchdog = TimgWatchdog(watchdog);
    let mut records = LogRecords;
    let config = Config::new();

    let orchestrator = Orchestrator::new(
        &CONTEXT,
        ProviderSet::new(wifi, &mut ble, &mut ir),
        Platform {
            clock: &UptimeClock,
            watchdog: &mut watchdog,
            memory: &HeapProbe,
            records: &mut records,
        },
        config,
    );

    let err = orchestrator.run(&mut Delay).await;
    // No more feeding: the watchdog resets the device
    log::error!("Fatal: {}, waiting for watchdog reset", err);
    loop {
        Timer::after(Duration::from_secs(60)).await;
    }
}

#[embassy_executor::task]
async fn console_task(mut rx: UartRx<'static, Async>, mut tx: UartTx<'static, Async>) {
    let mut console = Console::new();
    let mut reader = LineReader::new();
    let mut buf = [0u8; 64];

    loop {
        let read = select(
            rx.read_async(&mut buf),
            Timer::after(Duration::from_millis(CONSOLE_POLL_MS)),
        )
        .await;
        if let Either::First(Ok(n)) = read {
            for &byte in &buf[..n] {
                if let Some(line) = reader.feed(byte) {
                    let uptime = Instant::now().as_millis();
                    console.handle_line(line, &CONTEXT, uptime, &mut SerialOut(&mut tx));
                }
            }
        }

        while let Some(event) = CONTEXT.receive_event() {
            if let Some(line) = render_event(event) {
                SerialOut(&mut tx).write_line(&line);
            }
        }
    }
}

// ── Entry point ──────────────────────────────────────────────────────

#[esp_rtos::main]
async fn main(spawner: embassy_executor::Spawner) {
    esp_println::logger::init_logger_from_env();

    let peripherals = esp_hal::init(esp_hal::Config::default());

    // Heap for the radio stacks and event payloads.
    // ESP32 is tighter on DRAM.
    #[cfg(feature = "esp32")]
    {
        esp_alloc::heap_allocator!(size: 64 * 1024);
    }
    #[cfg(not(feature = "esp32"))]
    {
        esp_alloc::heap_allocator!(size: 128 * 1024);
    }

    // The RTOS needs a timer and a software interrupt
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    log::info!("Nightjar v{} starting on {}", VERSION, board::BOARD_NAME);

    let timg1 = TimerGroup::new(peripherals.TIMG1);
    let mut wdt = timg1.wdt;
    wdt.set_timeout(
        MwdtStage::Stage0,
        esp_hal::time::Duration::from_secs(WATCHDOG_TIMEOUT_S),
    );
    wdt.enable();

    // Hold power on (M5StickC Plus2 needs GPIO4 HIGH to stay powered)
    #[cfg(feature = "m5stickc")]
    let _power_hold = esp_hal::gpio::Output::new(
        peripherals.GPIO4,
        esp_hal::gpio::Level::High,
        esp_hal::gpio::OutputConfig::default(),
    );

    // ── Serial console ─────────────────────────────────────────────────

    let uart_config = uart::Config::default().with_baudrate(SERIAL_BAUD);
    #[cfg(feature = "esp32")]
    let (rx_pin, tx_pin) = (peripherals.GPIO3, peripherals.GPIO1);
    #[cfg(not(feature = "esp32"))]
    let (rx_pin, tx_pin) = (peripherals.GPIO44, peripherals.GPIO43);
    let uart = match Uart::new(peripherals.UART0, uart_config) {
        Ok(uart) => uart.with_rx(rx_pin).with_tx(tx_pin).into_async(),
        Err(e) => {
            log::error!("UART init failed: {:?}", e);
            return;
        }
    };
    let (rx, tx) = uart.split();

    // ── Radios ─────────────────────────────────────────────────────────
    // BLE must be initialized BEFORE WiFi for coexistence to work
    // (especially on ESP32-S3).

    let connector =
        match esp_radio::ble::controller::BleConnector::new(peripherals.BT, Default::default()) {
            Ok(connector) => connector,
            Err(e) => {
                log::error!("BLE connector init failed: {:?}", e);
                return;
            }
        };

    let (wifi_controller, wifi_interfaces) =
        match esp_radio::wifi::new(peripherals.WIFI, Default::default()) {
            Ok(wifi) => wifi,
            Err(e) => {
                log::error!("WiFi init failed: {:?}", e);
                return;
            }
        };

    static WIFI: StaticCell<WifiProvider> = StaticCell::new();
    let wifi = WIFI.init(WifiProvider::new(wifi_controller, wifi_interfaces.sniffer));

    if spawner.spawn(orchestrator_task(wifi, wdt)).is_err()
        || spawner.spawn(console_task(rx, tx)).is_err()
    {
        log::error!("Task spawn failed");
        return;
    }

    // ── BLE host stack ─────────────────────────────────────────────────

    let controller: ExternalController<_, 20> = ExternalController::new(connector);

    static HOST_RESOURCES: StaticCell<HostResources<DefaultPacketPool, 1, 2>> = StaticCell::new();
    let resources = HOST_RESOURCES.init(HostResources::new());

    let address = Address::random([0xff, 0x8f, 0x1a, 0x05, 0xe4, 0xab]);

    let stack = trouble_host::new(controller, resources).set_random_address(address);
    let Host {
        peripheral,
        central,
        mut runner,
        ..
    } = stack.build();

    log::info!("BLE host ready");

    let scan_handler = ScanEventHandler;
    embassy_futures::join::join(
        async {
            loop {
                if let Err(e) = runner.run_with_handler(&scan_handler).await {
                    log::error!("BLE runner error: {:?}", e);
                    Timer::after(Duration::from_secs(1)).await;
                }
            }
        },
        ble_provider::control(central, peripheral),
    )
    .await;
}
