use bytes::BytesMut;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use turn_relay_codec::{
    Decoder,
    channel_data::ChannelData,
    crypto::long_term_key,
    message::{MessageEncoder, attributes::*, methods::*},
};

const TRANSACTION_ID: [u8; 12] = [
    0x64, 0x4f, 0x5a, 0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33, 0x31,
];

fn samples() -> Vec<Vec<u8>> {
    let key = long_term_key("user1", "test", "localhost");
    let peer = "127.0.0.1:40000".parse().unwrap();
    let mut samples = Vec::new();
    let mut buf = BytesMut::with_capacity(1500);

    MessageEncoder::new(BINDING_REQUEST, &TRANSACTION_ID, &mut buf)
        .flush(None)
        .unwrap();
    samples.push(buf.to_vec());

    {
        let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TRANSACTION_ID, &mut buf);
        message.append::<RequestedTransport>(RequestedTransport::Udp);
        message.append::<UserName>("user1");
        message.append::<Realm>("localhost");
        message.append::<Nonce>("bm9uY2U=");
        message.flush(Some(&key)).unwrap();
    }

    samples.push(buf.to_vec());

    {
        let mut message = MessageEncoder::new(SEND_INDICATION, &TRANSACTION_ID, &mut buf);
        message.append::<XorPeerAddress>(peer);
        message.append::<Data>(&[0u8; 160]);
        message.flush(None).unwrap();
    }

    samples.push(buf.to_vec());

    ChannelData {
        number: 0x4000,
        bytes: &[0u8; 160],
    }
    .encode(&mut buf, false);
    samples.push(buf.to_vec());

    samples
}

fn criterion_benchmark(c: &mut Criterion) {
    let samples = samples();
    let mut samples = samples.iter().cycle();
    let mut decoder = Decoder::default();
    let mut buf = BytesMut::with_capacity(1500);
    let key = long_term_key("user1", "test", "localhost");
    let peer = "127.0.0.1:40000".parse().unwrap();

    let mut stun_criterion = c.benchmark_group("stun");

    stun_criterion.throughput(Throughput::Elements(1));
    stun_criterion.bench_function("decode_samples", |bencher| {
        bencher.iter(|| {
            decoder.decode(samples.next().unwrap()).unwrap();
        })
    });

    stun_criterion.bench_function("encode_data_indication", |bencher| {
        bencher.iter(|| {
            let mut message = MessageEncoder::new(DATA_INDICATION, &TRANSACTION_ID, &mut buf);
            message.append::<XorPeerAddress>(peer);
            message.append::<Data>(&[0u8; 160]);
            message.flush(None).unwrap();
        })
    });

    stun_criterion.bench_function("encode_signed_response", |bencher| {
        bencher.iter(|| {
            let mut message = MessageEncoder::new(ALLOCATE_RESPONSE, &TRANSACTION_ID, &mut buf);
            message.append::<XorRelayedAddress>(peer);
            message.append::<XorMappedAddress>(peer);
            message.append::<Lifetime>(600);
            message.flush(Some(&key)).unwrap();
        })
    });

    stun_criterion.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
