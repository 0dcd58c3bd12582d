use rdma_echo::ibverbs::completion::WorkCompletion;
use rdma_echo::ibverbs::device::DeviceList;
use rdma_echo::ibverbs::memory_region::{AlignedBuffer, PAGE_SIZE};
use rdma_echo::ibverbs::AccessFlags;

#[test]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let device_list = DeviceList::new()?;
    for device in &device_list {
        let ctx = device.open()?;
        let attr = ctx.query_device()?;
        assert!(attr.max_cqe() > 0);

        let pd = ctx.alloc_pd()?;
        let buffer = AlignedBuffer::zeroed(2 * PAGE_SIZE)?;
        let mr = unsafe {
            pd.reg_mr(
                buffer.as_ptr().as_ptr() as usize,
                buffer.len(),
                AccessFlags::LocalWrite | AccessFlags::RemoteRead | AccessFlags::RemoteWrite,
            )?
        };
        assert_eq!(mr.region_len(), 2 * PAGE_SIZE);
        println!("MR is {:?}, lkey is {}, rkey is {}", mr, mr.lkey(), mr.rkey());

        let cq = ctx.create_cq(32)?;
        assert!(cq.capacity() >= 32);
        let mut wcs = [WorkCompletion::default(); 4];
        assert_eq!(cq.poll(&mut wcs)?, 0);

        // the MR goes before the buffer it covers
        drop(mr);
        drop(buffer);
    }

    Ok(())
}
