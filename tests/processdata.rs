mod common;

use common::{init_logging, io_description, SimBus, SimSlave};
use soem_core::ethercat::{
    config::{config_init, config_map_group, config_overlap_map_group, SlaveDescription},
    main::{request_state, statecheck, Context},
    processdata::{receive_processdata, send_overlap_processdata, send_processdata},
    r#type::{EthercatState, SlaveState, TIMEOUT_RETURN, TIMEOUT_STATE},
};

fn configure(bus: &SimBus, descriptions: &[SlaveDescription]) -> Context {
    init_logging();
    let mut context = Context::new(bus.link());
    let found = config_init(&mut context, descriptions).unwrap();
    assert_eq!(usize::from(found), descriptions.len());
    context
}

fn operational(context: &Context) {
    request_state(context, 0, SlaveState::new(EthercatState::Operational)).unwrap();
    let outcome = statecheck(context, 0, EthercatState::Operational, TIMEOUT_STATE).unwrap();
    assert!(outcome.is_reached());
}

fn cycle(context: &Context) -> u16 {
    send_processdata(context).unwrap();
    receive_processdata(context, TIMEOUT_RETURN).unwrap()
}

#[test]
fn discovery_assigns_addresses_and_topology() {
    let bus = SimBus::new(vec![
        SimSlave::new(0x11).with_alias(7),
        SimSlave::new(0x11),
        SimSlave::new(0x22),
    ]);
    let context = configure(&bus, &[io_description(1, 8, 8), io_description(1, 8, 8), io_description(2, 0, 16)]);

    for slave in 1..=3 {
        assert_eq!(bus.word(slave, 0x10), 0x1000 + slave);
        assert_eq!(bus.al_status(slave), 2, "slave {slave} requested to PREOP");
    }
    let slaves = context.slaves();
    assert_eq!(slaves[1].alias_address, 7);
    assert_eq!(slaves[3].interface_type, 0x22);
    assert_eq!((slaves[1].topology, slaves[1].parent), (2, 0));
    assert_eq!((slaves[2].topology, slaves[2].parent), (2, 1));
    assert_eq!((slaves[3].topology, slaves[3].parent), (1, 2));
    assert_eq!(slaves[3].name.as_str(), "IO 0/16");
}

#[test]
fn cyclic_exchange_moves_outputs_and_inputs() {
    let bus = SimBus::new(vec![SimSlave::new(0x11), SimSlave::new(0x11)]);
    let mut context = configure(&bus, &[io_description(1, 8, 8), io_description(1, 16, 8)]);
    assert_eq!(config_map_group(&mut context, 0).unwrap(), 5);
    assert_eq!(bus.al_status(1), 4);

    let group = context.group(0).unwrap();
    assert_eq!((group.output_bytes, group.input_bytes), (3, 2));
    assert_eq!(group.expected_work_counter(), 6);
    operational(&context);

    context.set_slave_outputs(1, &[0xA5]).unwrap();
    context.set_slave_outputs(2, &[0x34, 0x12]).unwrap();
    bus.set_inputs(1, &[0x5A]);
    bus.set_inputs(2, &[0xC3]);

    assert_eq!(cycle(&context), 6);
    assert_eq!(bus.outputs(1, 1), [0xA5]);
    assert_eq!(bus.outputs(2, 2), [0x34, 0x12]);
    assert_eq!(context.slave_inputs(1).unwrap(), [0x5A]);
    assert_eq!(context.slave_inputs(2).unwrap(), [0xC3]);

    bus.set_inputs(2, &[0x3C]);
    assert_eq!(cycle(&context), 6);
    assert_eq!(context.slave_inputs(2).unwrap(), [0x3C]);
}

#[test]
fn bit_slaves_share_a_byte() {
    let bus = SimBus::new(vec![SimSlave::new(0x11), SimSlave::new(0x11), SimSlave::new(0x11)]);
    let mut context = configure(
        &bus,
        &[io_description(1, 2, 0), io_description(1, 4, 0), io_description(2, 0, 4)],
    );
    assert_eq!(config_map_group(&mut context, 0).unwrap(), 2);
    {
        let slaves = context.slaves();
        assert_eq!(slaves[1].outputs.map(|view| (view.offset, view.start_bit)), Some((0, 0)));
        assert_eq!(slaves[2].outputs.map(|view| (view.offset, view.start_bit)), Some((0, 2)));
        assert_eq!(slaves[3].inputs.map(|view| (view.offset, view.start_bit)), Some((1, 0)));
    }
    operational(&context);

    // Two bits for slave 1, four bits for slave 2 shifted by two
    context.group(0).unwrap().io_map()[0] = 0b0010_1110;
    bus.set_inputs(3, &[0b1001]);
    assert_eq!(cycle(&context), 2 * 2 + 1);
    assert_eq!(bus.outputs(1, 1)[0] & 0b11, 0b10);
    assert_eq!(bus.outputs(2, 1)[0] & 0b1111, 0b1011);
    assert_eq!(context.group(0).unwrap().io_map()[1] & 0b1111, 0b1001);
}

#[test]
fn overlapped_image_returns_inputs_in_place_of_outputs() {
    let bus = SimBus::new(vec![SimSlave::new(0x11), SimSlave::new(0x11)]);
    let mut context = configure(&bus, &[io_description(1, 16, 8), io_description(1, 8, 8)]);

    // Logical image of three bytes, outputs and inputs each get their copy
    assert_eq!(config_overlap_map_group(&mut context, 0).unwrap(), 6);
    operational(&context);

    context.set_slave_outputs(1, &[1, 2]).unwrap();
    context.set_slave_outputs(2, &[3]).unwrap();
    bus.set_inputs(1, &[0x10]);
    bus.set_inputs(2, &[0x20]);
    send_overlap_processdata(&context).unwrap();
    assert_eq!(receive_processdata(&context, TIMEOUT_RETURN).unwrap(), 6);

    assert_eq!(bus.outputs(1, 2), [1, 2]);
    assert_eq!(bus.outputs(2, 1), [3]);
    assert_eq!(context.slave_inputs(1).unwrap(), [0x10]);
    assert_eq!(context.slave_inputs(2).unwrap(), [0x20]);

    // Outputs survive the exchange
    assert_eq!(&context.group(0).unwrap().io_map()[..3], &[1, 2, 3]);
}

#[test]
fn slave_without_lrw_gets_separate_read_and_write() {
    let bus = SimBus::new(vec![SimSlave::new(0x11), SimSlave::new(0x11)]);
    let mut blocking = io_description(1, 8, 8);
    blocking.block_logical_read_write = true;
    let mut context = configure(&bus, &[blocking, io_description(1, 8, 8)]);
    config_map_group(&mut context, 0).unwrap();
    assert!(context.group(0).unwrap().block_logical_read_write);
    operational(&context);

    context.set_slave_outputs(2, &[0x77]).unwrap();
    bus.set_inputs(1, &[0x66]);
    let frames = bus.frames();
    // LRD counts the reading slaves once, LWR the writing slaves twice
    assert_eq!(cycle(&context), 6);
    assert_eq!(bus.frames() - frames, 2);
    assert_eq!(bus.outputs(2, 1), [0x77]);
    assert_eq!(context.slave_inputs(1).unwrap(), [0x66]);
}

#[test]
fn groups_map_into_their_own_logical_range() {
    let bus = SimBus::new(vec![SimSlave::new(0x11), SimSlave::new(0x11)]);
    let mut context = configure(&bus, &[io_description(1, 8, 8), io_description(1, 8, 8)]);
    context.slave_mut(2, |slave| slave.group = 1).unwrap();

    assert_eq!(config_map_group(&mut context, 1).unwrap(), 2);
    let group = context.group(1).unwrap();
    assert_eq!(group.logical_start_address, 1 << 16);
    assert_eq!(group.expected_work_counter(), 3);
    let fmmu = bus.memory(2, 0x600, 4);
    assert_eq!(u32::from_le_bytes([fmmu[0], fmmu[1], fmmu[2], fmmu[3]]), 1 << 16);

    // Slave 1 is not part of group 1
    assert_eq!(context.slave(1, |slave| slave.outputs).unwrap(), None);
    assert_eq!(bus.al_status(1), 2);
    assert_eq!(bus.al_status(2), 4);
}

fn large_group(bus: &SimBus, block_first: bool) -> Context {
    let mut descriptions = vec![io_description(1, 800, 800); 16];
    descriptions[0].block_logical_read_write = block_first;
    let mut context = configure(bus, &descriptions);
    assert_eq!(config_map_group(&mut context, 0).unwrap(), 3200);
    assert!(context.group(0).unwrap().io_segments.len() > 1);
    operational(&context);
    for slave in 1..=16u16 {
        context.set_slave_outputs(slave, &[slave as u8; 100]).unwrap();
        bus.set_inputs(slave, &[0x80 | slave as u8; 100]);
    }
    context
}

fn assert_exchanged(bus: &SimBus, context: &Context) {
    for slave in 1..=16u16 {
        assert_eq!(bus.outputs(slave, 100), [slave as u8; 100], "outputs of slave {slave}");
        assert_eq!(context.slave_inputs(slave).unwrap(), [0x80 | slave as u8; 100], "inputs of slave {slave}");
    }
}

#[test]
fn segmented_image_without_lrw_splits_reads_and_writes() {
    let bus = SimBus::new(vec![SimSlave::new(0x11); 16]);
    let context = large_group(&bus, true);
    assert!(context.group(0).unwrap().block_logical_read_write);

    let frames = bus.frames();
    assert_eq!(cycle(&context), 16 * 2 + 16);
    // Outputs and inputs each span two segments
    assert_eq!(bus.frames() - frames, 4);
    assert_exchanged(&bus, &context);
}

#[test]
fn segmented_image_is_exchanged_per_segment() {
    let bus = SimBus::new(vec![SimSlave::new(0x11); 16]);
    let context = large_group(&bus, false);
    let segments = context.group(0).unwrap().io_segments.len();

    let frames = bus.frames();
    assert_eq!(cycle(&context), 16 * 2 + 16);
    assert_eq!(bus.frames() - frames, segments);
    assert_exchanged(&bus, &context);
}
