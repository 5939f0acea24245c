#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use balancer_core::acquisition::{Acquisition, AcquisitionEvent};
use balancer_core::config::BalancerConfig;
use balancer_core::history::{SharedHistory, shared_history};
use balancer_core::pipeline::{ControlChannel, ControlCommand, Pipeline};
use balancer_core::telemetry::{TelemetryChannel, TelemetryForwarder, TelemetrySubscriber};
use balancer_firmware::bleed::{BleedPins, BleedPwm};
use balancer_firmware::front_end::AnalogFrontEnd;
use balancer_firmware::host_link::{LineBuffer, RttTransport, decode_host_line};
use embassy_executor::Spawner;
use embassy_futures::join::join3;
use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Ticker, Timer};
use esp_hal::analog::adc::{Adc, AdcConfig, Attenuation};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull};
use esp_hal::timer::timg::TimerGroup;
use log::{error, info, warn};
use rtt_target::{DownChannel, rtt_init};

/// One acquisition cycle per millisecond, 1000 per committed second
const CYCLE_PERIOD: Duration = Duration::from_millis(1);

const BUTTON_DEBOUNCE: Duration = Duration::from_millis(50);

const HOST_POLL_PERIOD: Duration = Duration::from_millis(20);

static HISTORY: SharedHistory = shared_history();
static TELEMETRY: TelemetryChannel = TelemetryChannel::new();
static CONTROL: ControlChannel = ControlChannel::new();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

/// Sole writer of pipeline state. Each completed burst is processed and the
/// next one is triggered before yielding.
async fn run_acquisition(
    mut acquisition: Acquisition<AnalogFrontEnd<'static>>,
    mut pipeline: Pipeline<'static, BleedPwm>,
) {
    let mut ticker = Ticker::every(CYCLE_PERIOD);
    loop {
        let buffer = *acquisition.driver().buffer();
        if let Err(e) =
            pipeline.on_acquisition_event(&mut acquisition, AcquisitionEvent::Done(&buffer))
        {
            error!("acquisition stopped: {}", e);
            panic!("analog front end failed");
        }
        ticker.next().await;
    }
}

/// Boot button toggles balancing; the LED mirrors the state
async fn run_button(mut button: Input<'static>, mut led: Output<'static>) {
    loop {
        button.wait_for_falling_edge().await;
        Timer::after(BUTTON_DEBOUNCE).await;
        if button.is_low() {
            CONTROL.send(ControlCommand::ToggleBalancing).await;
            led.toggle();
            button.wait_for_high().await;
        }
    }
}

/// Forwards telemetry to the host and feeds host writes back as commands
async fn run_host_link(mut down: DownChannel, mut telemetry: TelemetrySubscriber<'static>) {
    let mut forwarder = TelemetryForwarder::new(RttTransport, &HISTORY);
    let mut lines = LineBuffer::new();
    let mut rx = [0u8; 16];

    loop {
        match select(telemetry.next_message_pure(), Timer::after(HOST_POLL_PERIOD)).await {
            Either::First(event) => forwarder.forward(&event),
            Either::Second(()) => {
                let received = down.read(&mut rx);
                for &byte in &rx[..received] {
                    if !lines.push(byte) {
                        continue;
                    }
                    match decode_host_line(lines.line()) {
                        Ok(command) => CONTROL.send(command).await,
                        Err(e) => warn!("host write rejected: {}", e),
                    }
                    lines.clear();
                }
            }
        }
    }
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    let channels = rtt_init! {
        up: {
            0: {
                size: 1024,
                name: "Terminal"
            }
        }
        down: {
            0: {
                size: 64,
                name: "Host"
            }
        }
    };
    rtt_target::set_print_channel(channels.up.0);
    rtt_target::init_logger_with_level(log::LevelFilter::Info);

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    // postcard's alloc feature needs a global allocator
    esp_alloc::heap_allocator!(size: 16 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("Embassy initialized!");

    // Analog front end: raw codes, no eFuse correction; the balancer
    // calibration constants assume the 0 dB input range.
    let mut adc_config = AdcConfig::new();
    let lower = adc_config.enable_pin(peripherals.GPIO1, Attenuation::_0dB);
    let upper = adc_config.enable_pin(peripherals.GPIO2, Attenuation::_0dB);
    let adc = Adc::new(peripherals.ADC1, adc_config);

    let select_lines = [
        Output::new(peripherals.GPIO4, Level::Low, OutputConfig::default()),
        Output::new(peripherals.GPIO5, Level::Low, OutputConfig::default()),
        Output::new(peripherals.GPIO6, Level::Low, OutputConfig::default()),
    ];
    // active low, parked disabled
    let mux_enable = Output::new(peripherals.GPIO7, Level::High, OutputConfig::default());

    let front_end = AnalogFrontEnd::new(adc, lower, upper, select_lines, mux_enable);

    let bleed = BleedPwm::new(
        peripherals.LEDC,
        BleedPins {
            cell0: peripherals.GPIO8,
            cell1: peripherals.GPIO9,
            cell2: peripherals.GPIO10,
            cell3: peripherals.GPIO11,
            cell4: peripherals.GPIO12,
            cell5: peripherals.GPIO13,
            cell6: peripherals.GPIO14,
            cell7: peripherals.GPIO15,
        },
    )
    .expect("Failed to initialize bleed PWM");

    info!("Peripherals initialized!");

    let publisher = TELEMETRY
        .publisher()
        .expect("Telemetry publisher already taken");
    let subscriber = TELEMETRY
        .subscriber()
        .expect("Telemetry subscriber slots exhausted");

    let pipeline = Pipeline::new(
        BalancerConfig::default(),
        bleed,
        &HISTORY,
        publisher,
        &CONTROL,
    );

    let mut acquisition = Acquisition::new(front_end);
    acquisition.start().expect("Failed to start acquisition");

    let button = Input::new(
        peripherals.GPIO0,
        InputConfig::default().with_pull(Pull::Up),
    );
    let led = Output::new(peripherals.GPIO21, Level::Low, OutputConfig::default());

    join3(
        run_acquisition(acquisition, pipeline),
        run_button(button, led),
        run_host_link(channels.down.0, subscriber),
    )
    .await;

    unreachable!("pipeline loops never return")
}
