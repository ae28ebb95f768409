//! Integration tests for batch-to-sequence resharding.

use candle_core::{DType, Device, Tensor};
use ring_attention::{shard_batch_to_sequence, shard_sequence_to_batch, LocalWorld, ProcessGroup};

fn test_device() -> Device {
    Device::Cpu
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    let diff = (a - b).unwrap().abs().unwrap();
    diff.flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .into_iter()
        .fold(0.0, f32::max)
}

#[test]
fn test_round_trip_with_padding_across_four_ranks() {
    let device = test_device();
    let world_size = 4;
    let seq_len = 1000;
    let shard_size = 256; // pads 1000 -> 1024 = 4 shards of 256

    // Every rank holds its own batch of full sequences.
    let inputs: Vec<Tensor> = (0..world_size)
        .map(|_| Tensor::randn(0.0f32, 1.0, (2, seq_len, 8), &device).unwrap())
        .collect();

    let handles: Vec<_> = LocalWorld::create(world_size)
        .into_iter()
        .zip(inputs.iter().cloned())
        .map(|(group, x)| {
            std::thread::spawn(move || {
                let (shard, mask, sizes) =
                    shard_batch_to_sequence(&group, &x, None, shard_size).unwrap();
                assert_eq!(shard.dims(), &[8, shard_size, 8]); // gathered batch of 4 * 2

                // 24 pad positions live at the end of the last shard and
                // must be invalid; everything else is valid.
                let mask = mask.expect("padding must synthesize a mask");
                let flags: Vec<u8> = mask
                    .narrow(0, 0, 1)
                    .unwrap()
                    .flatten_all()
                    .unwrap()
                    .to_vec1()
                    .unwrap();
                let rank = group.rank();
                let global_start = rank * shard_size;
                for (i, flag) in flags.iter().enumerate() {
                    let expected = u8::from(global_start + i < seq_len);
                    assert_eq!(*flag, expected, "mask wrong at local position {i}");
                }

                let back = shard_sequence_to_batch(&group, &shard, &sizes).unwrap();
                back.narrow(1, 0, seq_len).unwrap()
            })
        })
        .collect();

    let results: Vec<Tensor> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Each rank recovers exactly its own batch items at exactly the
    // original length.
    for (rank, back) in results.iter().enumerate() {
        assert_eq!(back.dims(), &[2, seq_len, 8]);
        assert_eq!(max_abs_diff(back, &inputs[rank]), 0.0);
    }
}

#[test]
fn test_round_trip_uneven_batches() {
    let device = test_device();
    let world_size = 3;
    let seq_len = 12;
    let shard_size = 4;

    // Ranks contribute different batch sizes; `sizes` bookkeeping must
    // still invert the gather.
    let batch_sizes = [1usize, 3, 2];
    let inputs: Vec<Tensor> = batch_sizes
        .iter()
        .map(|&b| Tensor::randn(0.0f32, 1.0, (b, seq_len, 4), &device).unwrap())
        .collect();

    let handles: Vec<_> = LocalWorld::create(world_size)
        .into_iter()
        .zip(inputs.iter().cloned())
        .map(|(group, x)| {
            std::thread::spawn(move || {
                let (shard, mask, sizes) =
                    shard_batch_to_sequence(&group, &x, None, shard_size).unwrap();
                assert_eq!(sizes, vec![1, 3, 2]);
                assert_eq!(shard.dims(), &[6, shard_size, 4]);
                assert!(mask.is_none()); // no padding, no mask to synthesize

                shard_sequence_to_batch(&group, &shard, &sizes).unwrap()
            })
        })
        .collect();

    let results: Vec<Tensor> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for (rank, back) in results.iter().enumerate() {
        assert_eq!(back.dims(), &[batch_sizes[rank], seq_len, 4]);
        assert_eq!(max_abs_diff(back, &inputs[rank]), 0.0);
    }
}

#[test]
fn test_caller_mask_padded_not_overwritten() {
    let device = test_device();
    let world_size = 2;
    let seq_len = 6;
    let shard_size = 4; // pads to 8

    let handles: Vec<_> = LocalWorld::create(world_size)
        .into_iter()
        .map(|group| {
            std::thread::spawn(move || {
                let device = Device::Cpu;
                let x = Tensor::randn(0.0f32, 1.0, (1, seq_len, 2), &device).unwrap();
                // Caller already marks position 5 invalid.
                let mask =
                    Tensor::from_vec(vec![1u8, 1, 1, 1, 1, 0], (1, seq_len), &device).unwrap();

                let (_, mask_shard, _) =
                    shard_batch_to_sequence(&group, &x, Some(&mask), shard_size).unwrap();
                mask_shard.unwrap()
            })
        })
        .collect();

    let masks: Vec<Tensor> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Global mask: caller's [1,1,1,1,1,0] plus pad [0,0] over both gathered
    // batch rows; rank 0 holds positions 0..4, rank 1 positions 4..8.
    let rank0: Vec<u8> = masks[0].flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(rank0, vec![1, 1, 1, 1, 1, 1, 1, 1]);
    let rank1: Vec<u8> = masks[1].flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(rank1, vec![1, 0, 0, 0, 1, 0, 0, 0]);
}

#[test]
fn test_token_ids_round_trip() {
    let device = test_device();
    // 2D token tensors shard the same way as feature tensors.
    let world_size = 2;
    let seq_len = 7;
    let shard_size = 4; // pads to 8

    let inputs: Vec<Tensor> = (0..world_size)
        .map(|rank| {
            let ids: Vec<u32> = (0..seq_len as u32).map(|i| i + 10 * rank as u32).collect();
            Tensor::from_vec(ids, (1, seq_len), &device).unwrap()
        })
        .collect();

    let handles: Vec<_> = LocalWorld::create(world_size)
        .into_iter()
        .zip(inputs.iter().cloned())
        .map(|(group, x)| {
            std::thread::spawn(move || {
                let (shard, _, sizes) =
                    shard_batch_to_sequence(&group, &x, None, shard_size).unwrap();
                assert_eq!(shard.dtype(), DType::U32);
                shard_sequence_to_batch(&group, &shard, &sizes).unwrap()
            })
        })
        .collect();

    let results: Vec<Tensor> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for (rank, back) in results.iter().enumerate() {
        let ids: Vec<u32> = back
            .narrow(1, 0, seq_len)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let expected: Vec<u32> = (0..seq_len as u32).map(|i| i + 10 * rank as u32).collect();
        assert_eq!(ids, expected);
    }
}
