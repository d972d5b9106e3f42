// Step-stage sampling and page emission against real motion blocks.

use std::time::Duration;

use tokio::time::timeout;

use stepd_core::bed::ZFunc;
use stepd_core::config::Config;
use stepd_core::gcode::Gcode;
use stepd_core::physics::{MotionBlock, Move};
use stepd_core::vec4::Vec4;
use stepd_host::pipeline::{Message, PageData, Port, StepStage};

async fn recv(port: &mut Port) -> Message {
    timeout(Duration::from_secs(5), port.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("pipeline closed")
}

fn test_config() -> Config {
    Config {
        acceleration: Vec4::new(1000.0, 1000.0, 100.0, 10000.0),
        jerk: Vec4::new(15.0, 15.0, 0.4, 5.0),
        s_jerk: Vec4::new(50000.0, 50000.0, 500.0, 90000.0),
        steps_per_mm: Vec4::new(80.0, 80.0, 1600.0, 95.2),
        ticks_per_second: 30000,
        format: "SP_4x4D_128".into(),
        bed_max: [200.0, 200.0],
        bed_samples_path: "bed-samples.json".into(),
    }
}

async fn spawn_configured() -> (Port, Port) {
    let (up, head) = Port::pair(64);
    let (tail, down) = Port::pair(64);
    tokio::spawn(StepStage::new().run(head, tail));

    up.send(Message::Config(test_config())).await.unwrap();
    up.send(Message::Gcode(Gcode::parse("M92 X80 Y80 Z1600 E95.2").unwrap()))
        .await
        .unwrap();
    (up, down)
}

fn x_block(mm: f64, fr: f64) -> MotionBlock {
    let mv = Move::new(Vec4::ZERO, Vec4::new(mm, 0.0, 0.0, 0.0), fr);
    MotionBlock::trap(1000.0, 0.0, mv, 0.0).unwrap()
}

#[tokio::test]
async fn blocks_become_full_pages() {
    let (up, mut down) = spawn_configured().await;

    // 10 mm at 10 mm/s: dt = 1.01 s, 30000/7 samples/s -> 4328 segments
    up.send(Message::Block(x_block(10.0, 10.0))).await.unwrap();

    let mut pages: Vec<PageData> = Vec::new();
    loop {
        match recv(&mut down).await {
            Message::Page(p) => pages.push(p),
            Message::Block(_) => break, // the block itself trails its pages
            Message::Config(_) | Message::Gcode(_) => continue,
            other => panic!("unexpected {other:?}"),
        }
    }

    assert_eq!(pages.len(), 4328 / 128);
    for p in &pages {
        assert_eq!(p.data.len(), 256);
        assert_eq!(p.speed, 30000);
        assert_eq!(p.steps, 0); // full directional pages
        assert!(!p.has_dirs);
    }

    // total x steps packed so far: decode high nibbles across all pages
    let packed: i64 = pages
        .iter()
        .flat_map(|p| p.data.chunks(2))
        .map(|pair| (pair[0] >> 4) as i64 - 7)
        .sum();
    // 4224 of 4328 segments flushed; the rest still sit in the chunk
    assert!(packed > 0 && packed <= (10.0 * 80.0) as i64);
}

#[tokio::test]
async fn lin_advance_gcode_is_absorbed() {
    let (up, mut down) = spawn_configured().await;

    up.send(Message::Gcode(Gcode::parse("M900 K0.06").unwrap())).await.unwrap();
    up.send(Message::Gcode(Gcode::parse("G4 P0").unwrap())).await.unwrap();

    loop {
        match recv(&mut down).await {
            Message::Gcode(g) => {
                assert!(!g.is_m(900), "M900 must not reach the device");
                if g.is_g(4) {
                    break;
                }
            }
            Message::Config(_) => continue,
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[tokio::test]
async fn z_func_is_announced_and_forwarded() {
    let (mut up, mut down) = spawn_configured().await;

    up.send(Message::ZFunc(ZFunc::new(|_, _| 0.25))).await.unwrap();
    loop {
        if let Message::Line(l) = recv(&mut up).await {
            assert_eq!(l, "info:bed level z-func loaded");
            break;
        }
    }
    loop {
        match recv(&mut down).await {
            Message::ZFunc(_) => break,
            Message::Config(_) | Message::Gcode(_) => continue,
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[tokio::test]
async fn g92_reanchors_without_emitting_steps() {
    let (up, mut down) = spawn_configured().await;

    // jump the logical position; no page traffic may result
    up.send(Message::Gcode(Gcode::parse("G92 X100 Y50").unwrap())).await.unwrap();
    up.send(Message::Gcode(Gcode::parse("G4 P0").unwrap())).await.unwrap();

    loop {
        match recv(&mut down).await {
            Message::Page(p) => panic!("unexpected page: {p:?}"),
            Message::Gcode(g) if g.is_g(4) => break,
            _ => {}
        }
    }
}
