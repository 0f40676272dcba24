// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use sym53c8xx_rs::models::{
    message::{
        ExtendedMessage, M_EXTENDED, M_SIMPLE_TAG, MessageError, identify, tag_from_number,
        tag_number, task_prologue,
    },
    sense_data::{SenseData, SenseKey},
};

fn bytes(s: &str) -> Vec<u8> {
    hex::decode(s.replace(' ', "")).expect("test hex")
}

#[test]
fn sdtr_wire_format() -> Result<()> {
    let m = ExtendedMessage::Sync { period: 12, offset: 31 };
    assert_eq!(m.to_bytes(), bytes("01 03 01 0c 1f"));
    assert_eq!(ExtendedMessage::parse(&bytes("01 03 01 0c 1f"))?, m);
    Ok(())
}

#[test]
fn wdtr_wire_format() -> Result<()> {
    assert_eq!(ExtendedMessage::parse(&bytes("01 02 03 01"))?, ExtendedMessage::Wide { width: 1 });
    assert_eq!(ExtendedMessage::Wide { width: 0 }.wire_len(), 4);
    Ok(())
}

#[test]
fn modify_data_pointer_is_signed() -> Result<()> {
    let m = ExtendedMessage::parse(&bytes("01 05 00 ff ff fe 00"))?;
    assert_eq!(m, ExtendedMessage::ModifyDataPointer(-512));
    Ok(())
}

#[test]
fn malformed_messages() {
    assert_eq!(ExtendedMessage::parse(&[]), Err(MessageError::Truncated { need: 1, have: 0 }));
    assert_eq!(ExtendedMessage::parse(&[0x07]), Err(MessageError::NotExtended(0x07)));
    assert_eq!(
        ExtendedMessage::parse(&[M_EXTENDED, 0x02, 0x02, 0x00]),
        Err(MessageError::UnknownExtended(0x02))
    );
    assert_eq!(
        ExtendedMessage::parse(&bytes("01 04 01 0c 1f 00")),
        Err(MessageError::BadLength { code: 0x01, len: 4 })
    );
}

#[test]
fn tags_are_odd_on_the_wire() {
    for tag in [0u8, 1, 63, 127] {
        let n = tag_number(tag);
        assert_eq!(n & 1, 1);
        assert_eq!(tag_from_number(n), Some(tag));
    }
    assert_eq!(tag_from_number(0), None);
}

#[test]
fn identify_and_prologue() {
    assert_eq!(identify(3, false), 0x83);
    assert_eq!(identify(3, true), 0xc3);
    assert_eq!(task_prologue(0, false, None), vec![0x80]);
    assert_eq!(task_prologue(2, false, Some((M_SIMPLE_TAG, 5))), vec![0xc2, M_SIMPLE_TAG, 11]);
}

#[test]
fn fixed_sense_medium_error() -> Result<()> {
    let mut buf = [0u8; 18];
    buf[0] = 0xf0;
    buf[2] = 0x03;
    buf[3..7].copy_from_slice(&0x1234u32.to_be_bytes());
    buf[7] = 10;
    buf[12] = 0x11;
    buf[13] = 0x00;

    let s = SenseData::parse(&buf)?;
    assert!(s.valid);
    assert_eq!(s.key(), SenseKey::MediumError);
    assert_eq!(s.information, 0x1234);
    assert_eq!((s.asc, s.ascq), (0x11, 0x00));
    assert!(!s.is_reset_attention());
    Ok(())
}

#[test]
fn descriptor_sense_with_information() -> Result<()> {
    let buf = bytes("72 06 29 00 00 00 00 0c 00 0a 80 00 00 00 00 00 00 00 10 00");
    let s = SenseData::parse(&buf)?;
    assert_eq!(s.key(), SenseKey::UnitAttention);
    assert!(s.is_reset_attention());
    assert!(s.valid);
    assert_eq!(s.information, 0x1000);
    Ok(())
}

#[test]
fn short_or_unknown_sense_is_refused() {
    assert!(SenseData::parse(&[]).is_err());
    assert!(SenseData::parse(&[0x70, 0, 0x03]).is_err());
    assert!(SenseData::parse(&[0x7f; 18]).is_err());
}
