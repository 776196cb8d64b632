use switchbot::advertisement::{self, ParseError};
use switchbot::codec::{self, CodecError, Command, CurtainSpeed};
use switchbot::{Address, DeviceModel, DeviceState, LockStatus};

fn addr() -> Address {
    "c0:ff:ee:00:00:01".parse().unwrap()
}

/// Every command each model accepts, paired with the form decoding yields.
fn commands(model: DeviceModel) -> Vec<(Command, Command)> {
    use DeviceModel::*;
    let same = |c: Command| (c, c);
    match model {
        Bot => vec![
            same(Command::Press),
            same(Command::TurnOn),
            same(Command::TurnOff),
            same(Command::Status),
            (Command::BasicInfo, Command::Status),
        ],
        Curtain | Curtain3 => vec![
            same(Command::Stop),
            same(Command::Status),
            (Command::BasicInfo, Command::Status),
            (
                Command::Open {
                    speed: CurtainSpeed::Slow,
                },
                Command::SetPosition {
                    position: 0,
                    speed: CurtainSpeed::Slow,
                },
            ),
            (
                Command::Close {
                    speed: CurtainSpeed::Normal,
                },
                Command::SetPosition {
                    position: 100,
                    speed: CurtainSpeed::Normal,
                },
            ),
        ],
        Lock | LockPro => vec![
            same(Command::Lock),
            same(Command::Unlock),
            same(Command::UnlockWithoutUnlatch),
            same(Command::Status),
            same(Command::BasicInfo),
        ],
        PlugMini | PlugMiniJp => vec![
            same(Command::TurnOn),
            same(Command::TurnOff),
            same(Command::Toggle),
            same(Command::Status),
        ],
        Meter | MeterPlus | OutdoorMeter => Vec::new(),
    }
}

#[test]
fn every_command_decodes_back_to_itself() {
    for model in DeviceModel::ALL {
        for (command, expected) in commands(model) {
            let frame = codec::encode(model, &command).unwrap();
            assert_eq!(frame.encrypted, model.requires_encryption(), "{model} {command:?}");
            let decoded = codec::decode_command(model, &frame.to_bytes()).unwrap();
            assert_eq!(decoded, expected, "{model} {command:?}");
        }
    }
}

#[test]
fn curtain_position_round_trips_over_full_range() {
    for model in [DeviceModel::Curtain, DeviceModel::Curtain3] {
        for speed in [CurtainSpeed::Normal, CurtainSpeed::Slow] {
            for position in 0..=100u8 {
                let command = Command::SetPosition { position, speed };
                let frame = codec::encode(model, &command).unwrap();
                assert_eq!(
                    codec::decode_command(model, &frame.to_bytes()).unwrap(),
                    command
                );
            }
        }
    }
}

#[test]
fn curtain_position_above_range_is_invalid() {
    for position in 101..=u8::MAX {
        let err = codec::encode(
            DeviceModel::Curtain,
            &Command::SetPosition {
                position,
                speed: CurtainSpeed::Normal,
            },
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::InvalidArgument(_)));
    }
}

#[test]
fn encoding_is_deterministic() {
    let command = Command::SetPosition {
        position: 42,
        speed: CurtainSpeed::Normal,
    };
    let a = codec::encode(DeviceModel::Curtain, &command).unwrap();
    let b = codec::encode(DeviceModel::Curtain, &command).unwrap();
    assert_eq!(a, b);
}

#[test]
fn commands_for_other_families_are_unsupported() {
    let cases = [
        (DeviceModel::Bot, Command::Lock),
        (DeviceModel::Curtain, Command::TurnOn),
        (DeviceModel::Lock, Command::Press),
        (DeviceModel::PlugMini, Command::Stop),
        (DeviceModel::Meter, Command::Status),
    ];
    for (model, command) in cases {
        assert!(matches!(
            codec::encode(model, &command),
            Err(CodecError::UnsupportedCommand { .. })
        ));
    }
}

#[test]
fn curtain_advertisement_reports_position() {
    let adv = advertisement::parse(addr(), -62, &[0x63, 0x00, 0x32, 0x64, 0x00]).unwrap();
    assert_eq!(adv.model, DeviceModel::Curtain);
    assert!(!adv.encrypted);
    match adv.state {
        DeviceState::Curtain(curtain) => {
            assert_eq!(curtain.position, 50);
            assert!(!curtain.is_moving);
            assert_eq!(curtain.battery, 100);
        }
        other => panic!("expected curtain state, got {other:?}"),
    }
}

fn minimal_advertisement(model: DeviceModel) -> Vec<u8> {
    let len = match model.family() {
        switchbot::ModelFamily::Bot => 3,
        switchbot::ModelFamily::Curtain => 5,
        switchbot::ModelFamily::Lock if model == DeviceModel::LockPro => 6,
        switchbot::ModelFamily::Lock => 5,
        switchbot::ModelFamily::Meter | switchbot::ModelFamily::Plug => 6,
    };
    let mut bytes = vec![0u8; len];
    bytes[0] = model.model_byte();
    bytes
}

#[test]
fn advertisement_minimum_length_boundary() {
    for model in DeviceModel::ALL {
        let bytes = minimal_advertisement(model);
        let adv = advertisement::parse(addr(), -40, &bytes).unwrap();
        assert_eq!(adv.model, model);
        assert_eq!(adv.state.family(), model.family());

        let short = &bytes[..bytes.len() - 1];
        assert!(
            matches!(
                advertisement::parse(addr(), -40, short),
                Err(ParseError::MalformedFrame(_))
            ),
            "{model} accepted {} bytes",
            short.len()
        );
    }
}

#[test]
fn unknown_model_byte_is_reported() {
    assert_eq!(
        advertisement::parse(addr(), -40, &[0x7e, 0, 0, 0, 0, 0]),
        Err(ParseError::UnknownModel(0x7e))
    );
}

#[test]
fn lock_status_vendor_vectors() {
    let lock = |data: &str, model| {
        let mut bytes = vec![0x01];
        bytes.extend(hex::decode(data).unwrap());
        codec::decode(model, &bytes).unwrap().as_lock().cloned().unwrap()
    };

    let state = lock("8000", DeviceModel::Lock);
    assert_eq!(state.status, LockStatus::Locked);
    assert!(state.calibrated && state.locked && !state.door_open);

    let state = lock("9400", DeviceModel::Lock);
    assert_eq!(state.status, LockStatus::Unlocked);
    assert!(state.door_open);

    let state = lock("9010000000c0", DeviceModel::LockPro);
    assert_eq!(state.status, LockStatus::Locking);
    assert!(state.door_open && state.unclosed_alarm && state.unlocked_alarm);
}

#[test]
fn truncated_status_response_is_malformed() {
    let err = codec::decode(DeviceModel::Curtain, &[0x01, 0x64, 0x0b, 0x01, 0x00, 0x04, 0x32])
        .unwrap_err();
    assert!(matches!(err, CodecError::MalformedFrame(_)));
}

#[test]
fn rejected_status_surfaces_before_decoding() {
    let err = codec::decode(DeviceModel::PlugMini, &[0x09]).unwrap_err();
    assert!(err.is_auth_rejection());
}
