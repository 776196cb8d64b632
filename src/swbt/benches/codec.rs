use criterion::{black_box, criterion_group, criterion_main, Criterion};
use switchbot::codec::{self, Command, CurtainSpeed};
use switchbot::crypto::Handshake;
use switchbot::{advertisement, Address, DeviceModel, KeyMaterial};

fn bench_encode(c: &mut Criterion) {
    let command = Command::SetPosition {
        position: 42,
        speed: CurtainSpeed::Normal,
    };
    c.bench_function("encode_curtain_position", |b| {
        b.iter(|| codec::encode(DeviceModel::Curtain, black_box(&command)))
    });
    c.bench_function("encode_lock_unlock", |b| {
        b.iter(|| codec::encode(DeviceModel::LockPro, black_box(&Command::Unlock)))
    });
}

fn bench_advertisement(c: &mut Criterion) {
    let address = Address::mac([0xc0, 0xff, 0xee, 0, 0, 1]);
    let curtain = [0x63, 0x40, 0x32, 0x64, 0x11];
    let lock_pro = [0xa4, 0x00, 0x50, 0x98, 0x40, 0x00];
    c.bench_function("parse_curtain_advertisement", |b| {
        b.iter(|| advertisement::parse(address, -60, black_box(&curtain)))
    });
    c.bench_function("parse_lock_pro_advertisement", |b| {
        b.iter(|| advertisement::parse(address, -60, black_box(&lock_pro)))
    });
}

fn bench_seal(c: &mut Criterion) {
    let key = KeyMaterial::new(0xff, [0x42; 16]);
    let frame = match codec::encode(DeviceModel::Lock, &Command::Unlock) {
        Ok(frame) => frame,
        Err(err) => panic!("unlock frame: {err}"),
    };
    let mut response = vec![0x01, 0x00, 0x00, 0x00];
    response.extend_from_slice(&[0x5a; 16]);

    c.bench_function("handshake_and_seal", |b| {
        b.iter(|| {
            let mut handshake = Handshake::new(key.clone());
            let _ = handshake.request();
            let _ = handshake.accept(black_box(&response), None);
            handshake
                .finish()
                .and_then(|mut session| session.seal(black_box(&frame)))
        })
    });
}

criterion_group!(benches, bench_encode, bench_advertisement, bench_seal);
criterion_main!(benches);
